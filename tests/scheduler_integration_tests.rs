//! End-to-end scheduler scenarios driven through real child processes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use taskly_cli::core::color::ColorFormatter;
use taskly_cli::core::events::{EventBus, TaskEvent};
use taskly_cli::core::pm::{PackageManagerKind, PackageManagerResolver, StaticPmProber};
use taskly_cli::core::scheduler::{DependencyEdge, ExecuteOptions, Scheduler};
use taskly_cli::core::task::{OutputKind, TaskConfig, TaskStatus};

fn scheduler() -> Arc<Scheduler> {
    Arc::new(Scheduler::with_parts(
        EventBus::new(),
        Arc::new(ColorFormatter::with_support(false)),
        Arc::new(PackageManagerResolver::with_prober(Arc::new(
            StaticPmProber::with_available(&[PackageManagerKind::Npm]),
        ))),
    ))
}

fn options() -> ExecuteOptions {
    ExecuteOptions {
        task_timeout: 20_000,
        global_timeout: 60_000,
        ..ExecuteOptions::default()
    }
}

#[tokio::test]
async fn two_echo_tasks_complete_with_their_output() {
    let scheduler = scheduler();
    let mut rx = scheduler.subscribe();
    let batch = vec![
        TaskConfig::new("echo hello").with_identifier("a"),
        TaskConfig::new("echo world").with_identifier("b"),
    ];
    let opts = ExecuteOptions {
        max_concurrency: Some(2),
        ..options()
    };

    let results = scheduler.execute(batch, opts).await.unwrap();
    assert_eq!(results.len(), 2);
    for result in &results {
        assert_eq!(result.exit_code, 0);
    }
    let a = results.iter().find(|r| r.identifier == "a").unwrap();
    let b = results.iter().find(|r| r.identifier == "b").unwrap();
    assert!(a.stream_text(OutputKind::Stdout).contains("hello"));
    assert!(b.stream_text(OutputKind::Stdout).contains("world"));

    let mut successful = None;
    while let Ok(event) = rx.try_recv() {
        if let TaskEvent::ExecutionComplete {
            successful: count, ..
        } = event
        {
            successful = Some(count);
        }
    }
    assert_eq!(successful, Some(2));
}

#[tokio::test]
async fn kill_others_on_fail_stops_the_slow_task() {
    let scheduler = scheduler();
    let batch = vec![
        TaskConfig::new("exit 1").with_identifier("fail"),
        TaskConfig::new("sleep 3").with_identifier("slow"),
    ];
    let opts = ExecuteOptions {
        kill_others_on_fail: true,
        ..options()
    };

    let started = Instant::now();
    let results = scheduler.execute(batch, opts).await.unwrap();
    let wall = started.elapsed();

    let fail = results.iter().find(|r| r.identifier == "fail").unwrap();
    let slow = results.iter().find(|r| r.identifier == "slow").unwrap();
    assert_eq!(fail.exit_code, 1);
    assert!(slow.exit_code > 0);
    assert_eq!(
        scheduler.task_state("slow").unwrap().status,
        TaskStatus::Killed
    );
    assert!(
        wall < Duration::from_millis(2_500),
        "kill-others must beat the 3 s sleep, took {wall:?}"
    );
}

#[tokio::test]
async fn max_concurrency_one_runs_sequentially() {
    let scheduler = scheduler();
    let batch = vec![
        TaskConfig::new("sleep 1").with_identifier("first"),
        TaskConfig::new("sleep 1").with_identifier("second"),
    ];
    let opts = ExecuteOptions {
        max_concurrency: Some(1),
        ..options()
    };

    let started = Instant::now();
    let results = scheduler.execute(batch, opts).await.unwrap();
    let wall = started.elapsed();

    assert!(wall >= Duration::from_secs(2), "took {wall:?}");
    let first = results.iter().find(|r| r.identifier == "first").unwrap();
    let second = results.iter().find(|r| r.identifier == "second").unwrap();
    assert!(second.start_time_ms >= first.end_time_ms);
}

#[tokio::test]
async fn retry_exhaustion_reports_retries() {
    let scheduler = scheduler();
    let mut rx = scheduler.subscribe();
    let batch = vec![TaskConfig::new("exit 1").with_identifier("flaky")];
    let opts = ExecuteOptions {
        retry_failed_tasks: true,
        max_retries: 2,
        retry_delay: 10,
        ..options()
    };

    let results = scheduler.execute(batch, opts).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].retries, 2);
    assert_ne!(results[0].exit_code, 0);

    let mut starts = 0;
    let mut permanent = 0;
    let mut retries_seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            TaskEvent::TaskStart { .. } => starts += 1,
            TaskEvent::TaskFailedPermanently { retries, .. } => {
                permanent += 1;
                retries_seen.push(retries);
            }
            _ => {}
        }
    }
    // Three child attempts: the original plus two retries.
    assert_eq!(starts, 3);
    assert_eq!(permanent, 1);
    assert_eq!(retries_seen, vec![2]);
}

#[tokio::test]
async fn zero_max_retries_means_no_retry() {
    let scheduler = scheduler();
    let mut rx = scheduler.subscribe();
    let batch = vec![TaskConfig::new("exit 1")];
    let opts = ExecuteOptions {
        retry_failed_tasks: true,
        max_retries: 0,
        retry_delay: 10,
        ..options()
    };
    let results = scheduler.execute(batch, opts).await.unwrap();
    assert_eq!(results[0].retries, 0);

    let mut starts = 0;
    let mut permanent = 0;
    while let Ok(event) = rx.try_recv() {
        match event.name() {
            "task:start" => starts += 1,
            "task:failed-permanently" => permanent += 1,
            _ => {}
        }
    }
    assert_eq!(starts, 1);
    assert_eq!(permanent, 1);
}

#[tokio::test]
async fn dependency_chain_orders_start_times() {
    let scheduler = scheduler();
    let mut rx = scheduler.subscribe();
    let batch = vec![
        TaskConfig::new("echo a").with_identifier("a"),
        TaskConfig::new("echo b").with_identifier("b"),
    ];
    let opts = ExecuteOptions {
        dependencies: vec![DependencyEdge::new("b", vec!["a".into()])],
        ..options()
    };

    let results = scheduler.execute(batch, opts).await.unwrap();
    let a = results.iter().find(|r| r.identifier == "a").unwrap();
    let b = results.iter().find(|r| r.identifier == "b").unwrap();
    assert_eq!(a.exit_code, 0);
    assert_eq!(b.exit_code, 0);
    assert!(b.start_time_ms >= a.end_time_ms);

    // b's start must come strictly after a's completion event.
    let mut saw_a_complete = false;
    let mut b_started_after_a = false;
    let mut saw_deps_satisfied = false;
    while let Ok(event) = rx.try_recv() {
        match &event {
            TaskEvent::TaskComplete { identifier, .. } if identifier == "a" => {
                saw_a_complete = true;
            }
            TaskEvent::TaskStart { identifier, .. } if identifier == "b" => {
                b_started_after_a = saw_a_complete;
            }
            TaskEvent::TaskDependenciesSatisfied { identifier } if identifier == "b" => {
                saw_deps_satisfied = true;
            }
            _ => {}
        }
    }
    assert!(b_started_after_a);
    assert!(saw_deps_satisfied);
}

#[tokio::test]
async fn dependent_of_failed_task_is_never_admitted() {
    let scheduler = scheduler();
    let mut rx = scheduler.subscribe();
    let batch = vec![
        TaskConfig::new("exit 1").with_identifier("broken"),
        TaskConfig::new("echo never").with_identifier("dependent"),
    ];
    let opts = ExecuteOptions {
        continue_on_error: true,
        dependencies: vec![DependencyEdge::new("dependent", vec!["broken".into()])],
        ..options()
    };

    let results = scheduler.execute(batch, opts).await.unwrap();
    let dependent = results
        .iter()
        .find(|r| r.identifier == "dependent")
        .unwrap();
    assert_eq!(dependent.exit_code, 2);
    assert_eq!(
        scheduler.task_state("dependent").unwrap().status,
        TaskStatus::Killed
    );
    while let Ok(event) = rx.try_recv() {
        if let TaskEvent::TaskStart { identifier, .. } = &event {
            assert_ne!(identifier, "dependent");
        }
    }
}

#[tokio::test]
async fn continue_on_error_lets_siblings_finish() {
    let scheduler = scheduler();
    let batch = vec![
        TaskConfig::new("exit 1").with_identifier("bad"),
        TaskConfig::new("echo fine").with_identifier("good"),
    ];
    let opts = ExecuteOptions {
        continue_on_error: true,
        max_concurrency: Some(1),
        ..options()
    };
    let results = scheduler.execute(batch, opts).await.unwrap();
    let good = results.iter().find(|r| r.identifier == "good").unwrap();
    assert_eq!(good.exit_code, 0);
}

#[tokio::test]
async fn halt_without_continue_on_error_skips_unstarted_work() {
    let scheduler = scheduler();
    let batch = vec![
        TaskConfig::new("exit 7").with_identifier("bad"),
        TaskConfig::new("echo skipped").with_identifier("later"),
    ];
    let opts = ExecuteOptions {
        max_concurrency: Some(1),
        ..options()
    };
    let results = scheduler.execute(batch, opts).await.unwrap();
    let bad = results.iter().find(|r| r.identifier == "bad").unwrap();
    let later = results.iter().find(|r| r.identifier == "later").unwrap();
    assert_eq!(bad.exit_code, 7);
    // Admissions halted, so the second task never started.
    assert_eq!(later.exit_code, 2);
}

#[tokio::test]
async fn kill_others_with_continue_on_error_spares_siblings() {
    // Documented policy resolution: kill-others only dominates while
    // continue-on-error is off.
    let scheduler = scheduler();
    let batch = vec![
        TaskConfig::new("exit 1").with_identifier("bad"),
        TaskConfig::new("sleep 0.3 && echo done").with_identifier("survivor"),
    ];
    let opts = ExecuteOptions {
        kill_others_on_fail: true,
        continue_on_error: true,
        ..options()
    };
    let results = scheduler.execute(batch, opts).await.unwrap();
    let survivor = results.iter().find(|r| r.identifier == "survivor").unwrap();
    assert_eq!(survivor.exit_code, 0);
}

#[tokio::test]
async fn task_timeout_produces_timeout_event_before_terminal() {
    let scheduler = scheduler();
    let mut rx = scheduler.subscribe();
    let batch = vec![TaskConfig::new("sleep 10").with_identifier("hang")];
    let opts = ExecuteOptions {
        task_timeout: 150,
        ..options()
    };
    let results = scheduler.execute(batch, opts).await.unwrap();
    assert_ne!(results[0].exit_code, 0);

    let mut timeline = Vec::new();
    while let Ok(event) = rx.try_recv() {
        timeline.push(event.name().to_string());
    }
    let timeout_at = timeline.iter().position(|n| n == "task:timeout");
    let terminal_at = timeline
        .iter()
        .position(|n| n == "task:failed-permanently");
    assert!(timeout_at.is_some());
    assert!(terminal_at.is_some());
    assert!(timeout_at < terminal_at);
}

#[tokio::test]
async fn stop_prevents_further_starts() {
    let scheduler = scheduler();
    let mut rx = scheduler.subscribe();
    let batch = vec![
        TaskConfig::new("sleep 5").with_identifier("running"),
        TaskConfig::new("echo queued").with_identifier("queued"),
    ];
    let opts = ExecuteOptions {
        max_concurrency: Some(1),
        ..options()
    };

    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.execute(batch, opts).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    scheduler.stop(taskly_cli::core::process::SIGNAL_KILL);
    let results = handle.await.unwrap().unwrap();

    assert_eq!(results.len(), 2);
    let queued = results.iter().find(|r| r.identifier == "queued").unwrap();
    assert_eq!(queued.exit_code, 2);

    let mut stopped_seen = false;
    while let Ok(event) = rx.try_recv() {
        match event.name() {
            "execution:stopped" => stopped_seen = true,
            "task:start" => {
                assert!(!stopped_seen, "no task may start after execution:stopped");
            }
            _ => {}
        }
    }
    assert!(stopped_seen);
}

#[tokio::test]
async fn kill_task_is_policy_neutral() {
    let scheduler = scheduler();
    let batch = vec![
        TaskConfig::new("sleep 5").with_identifier("victim"),
        TaskConfig::new("sleep 0.4 && echo alive").with_identifier("bystander"),
    ];
    // kill-others armed: a manual kill must not trigger the cascade.
    let opts = ExecuteOptions {
        kill_others_on_fail: true,
        ..options()
    };

    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.execute(batch, opts).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(scheduler.kill_task("victim", taskly_cli::core::process::SIGNAL_KILL));
    let results = handle.await.unwrap().unwrap();

    let victim = results.iter().find(|r| r.identifier == "victim").unwrap();
    let bystander = results.iter().find(|r| r.identifier == "bystander").unwrap();
    assert_ne!(victim.exit_code, 0);
    assert_eq!(bystander.exit_code, 0);
}

#[tokio::test]
async fn output_lines_reconstruct_the_stream() {
    let scheduler = scheduler();
    let batch = vec![
        TaskConfig::new("printf 'one\\ntwo\\nthree\\n'; printf 'tail-no-newline'")
            .with_identifier("printer"),
    ];
    let results = scheduler.execute(batch, options()).await.unwrap();
    assert_eq!(
        results[0].stream_text(OutputKind::Stdout),
        "one\ntwo\nthree\ntail-no-newline"
    );
}

#[tokio::test]
async fn global_timeout_surfaces_system_error() {
    let scheduler = scheduler();
    let mut rx = scheduler.subscribe();
    let batch = vec![TaskConfig::new("sleep 10").with_identifier("forever")];
    let opts = ExecuteOptions {
        global_timeout: 200,
        ..options()
    };
    let err = scheduler.execute(batch, opts).await.unwrap_err();
    assert!(matches!(
        err,
        taskly_cli::error::TasklyError::System { .. }
    ));
    let mut saw_global_timeout = false;
    while let Ok(event) = rx.try_recv() {
        if event.name() == "execution:global-timeout" {
            saw_global_timeout = true;
        }
    }
    assert!(saw_global_timeout);
    // The scheduler must be reusable even after a timed-out run.
    let results = scheduler
        .execute(vec![TaskConfig::new("echo ok")], options())
        .await
        .unwrap();
    assert_eq!(results[0].exit_code, 0);
}

#[tokio::test]
async fn pause_holds_admissions_until_resume() {
    let scheduler = scheduler();
    let batch = vec![
        TaskConfig::new("sleep 0.3").with_identifier("first"),
        TaskConfig::new("echo second").with_identifier("second"),
    ];
    let opts = ExecuteOptions {
        max_concurrency: Some(1),
        ..options()
    };
    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.execute(batch, opts).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.pause();
    tokio::time::sleep(Duration::from_millis(500)).await;
    // "first" has exited by now but "second" must still be pending.
    assert_eq!(
        scheduler.task_state("second").unwrap().status,
        TaskStatus::Pending
    );
    scheduler.resume();
    let results = handle.await.unwrap().unwrap();
    assert!(results.iter().all(|r| r.exit_code == 0));
}

#[tokio::test]
async fn per_task_env_overlay_reaches_the_child() {
    let scheduler = scheduler();
    let batch = vec![
        TaskConfig::new("echo value=$DEMO_FLAG")
            .with_identifier("env-test")
            .with_env("DEMO_FLAG", "42"),
    ];
    let results = scheduler.execute(batch, options()).await.unwrap();
    assert!(
        results[0]
            .stream_text(OutputKind::Stdout)
            .contains("value=42")
    );
}
