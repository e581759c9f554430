// tests/runtime_behaviour.rs
mod common;
use crate::common::builders::{ConfigFileBuilder, UnitConfigBuilder};
use crate::common::{FakeLauncher, Harness, init_tracing, with_timeout};

use std::error::Error;
use std::time::Duration;

use tokio::sync::oneshot;

use taskhost::config::ConfigFile;
use taskhost::engine::{RunRequest, Runtime, RuntimeEvent, RuntimeOptions};
use taskhost::types::{ConflictPolicy, LaunchOutcome, Role, SourceUnitId};

type TestResult = Result<(), Box<dyn Error>>;

fn waiting_tool() -> ConfigFile {
    ConfigFileBuilder::new()
        .with_unit(
            1,
            UnitConfigBuilder::new("tool.sh")
                .role(Role::Executable)
                .if_running(ConflictPolicy::Wait)
                .build(),
        )
        .build()
}

fn request(unit: u32) -> (RuntimeEvent, oneshot::Receiver<LaunchOutcome>) {
    let (tx, rx) = oneshot::channel();
    let event = RuntimeEvent::RunRequested {
        request: RunRequest {
            interactive: false,
            ..RunRequest::new(SourceUnitId(unit))
        },
        reply: Some(tx),
    };
    (event, rx)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    while !cond() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_spawns(launcher: &FakeLauncher, n: usize) {
    wait_until(|| launcher.spawn_count() >= n).await;
}

#[cfg(unix)]
fn preloaded_script(pipe_dir: &std::path::Path) -> ConfigFile {
    ConfigFileBuilder::new()
        .with_unit(
            1,
            UnitConfigBuilder::new("script.sh")
                .role(Role::Script)
                .if_running(ConflictPolicy::Run)
                .preloaded(true)
                .build(),
        )
        .pipe_dir(pipe_dir)
        .privilege_control(false)
        .build()
}

#[tokio::test]
async fn runtime_replies_and_stops_when_idle() -> TestResult {
    with_timeout(async {
        init_tracing();
        let Harness {
            host,
            events_rx,
            events_tx,
            launcher,
            ..
        } = Harness::new(waiting_tool());

        let (first, first_reply) = request(1);
        let (second, second_reply) = request(1);
        events_tx.send(first).await?;
        events_tx.send(second).await?;

        let options = RuntimeOptions {
            exit_when_idle: true,
            detach: false,
        };
        let driver = async {
            assert_eq!(first_reply.await, Ok(LaunchOutcome::Started(1000)));
            assert_eq!(second_reply.await, Ok(LaunchOutcome::Deferred));

            launcher.exit(1000, 0);
            wait_for_spawns(&launcher, 2).await;
            launcher.exit(1001, 0);
        };

        let (host, ()) = tokio::join!(Runtime::new(host, options, events_rx).run(), driver);
        let host = host?;
        assert!(host.scheduler().is_idle());
        assert_eq!(launcher.spawn_count(), 2);

        Ok(())
    })
    .await
}

#[tokio::test]
async fn detached_runtime_leaves_tasks_running() -> TestResult {
    with_timeout(async {
        init_tracing();
        let Harness {
            host,
            events_rx,
            events_tx,
            launcher,
            ..
        } = Harness::new(waiting_tool());

        let (event, reply) = request(1);
        events_tx.send(event).await?;

        let options = RuntimeOptions {
            exit_when_idle: true,
            detach: true,
        };
        let host = Runtime::new(host, options, events_rx).run().await?;

        assert_eq!(reply.await?, LaunchOutcome::Started(1000));
        assert_eq!(host.scheduler().running_tasks().count(), 1);
        assert!(launcher.is_alive(1000));

        Ok(())
    })
    .await
}

#[tokio::test]
async fn shutdown_request_stops_the_runtime_and_its_tasks() -> TestResult {
    with_timeout(async {
        init_tracing();
        let Harness {
            host,
            events_rx,
            events_tx,
            launcher,
            ..
        } = Harness::new(waiting_tool());

        let (run, _reply) = request(1);
        let (queued, queued_reply) = request(1);
        events_tx.send(run).await?;
        events_tx.send(queued).await?;
        events_tx.send(RuntimeEvent::ShutdownRequested).await?;

        let host = Runtime::new(host, RuntimeOptions::default(), events_rx)
            .run()
            .await?;

        assert_eq!(queued_reply.await?, LaunchOutcome::Deferred);
        assert_eq!(host.scheduler().waiting_len(), 0);
        wait_until(|| !launcher.is_alive(1000)).await;

        Ok(())
    })
    .await
}

#[tokio::test]
async fn runtime_stops_when_every_waiting_run_fails_to_start() -> TestResult {
    with_timeout(async {
        init_tracing();
        let Harness {
            host,
            events_rx,
            events_tx,
            launcher,
            ..
        } = Harness::new(waiting_tool());

        let (first, first_reply) = request(1);
        let (second, second_reply) = request(1);
        let (third, third_reply) = request(1);
        for event in [first, second, third] {
            events_tx.send(event).await?;
        }

        let options = RuntimeOptions {
            exit_when_idle: true,
            detach: false,
        };
        let driver = async {
            assert_eq!(first_reply.await, Ok(LaunchOutcome::Started(1000)));
            assert_eq!(second_reply.await, Ok(LaunchOutcome::Deferred));
            assert_eq!(third_reply.await, Ok(LaunchOutcome::Deferred));

            launcher.set_failing(true);
            launcher.exit(1000, 0);
        };

        let (host, ()) = tokio::join!(Runtime::new(host, options, events_rx).run(), driver);
        let host = host?;
        assert!(host.scheduler().is_idle());
        assert_eq!(launcher.spawn_count(), 1);

        Ok(())
    })
    .await
}

#[cfg(unix)]
#[tokio::test]
async fn preloaded_helper_takes_the_next_run() -> TestResult {
    use taskhost::exec::PrivilegeLevel;

    with_timeout(async {
        init_tracing();
        let pipes = tempfile::tempdir()?;
        let mut h = Harness::new(preloaded_script(pipes.path()));

        // Cold start: the helper is spawned on demand, then replaced.
        let first = h.host.run_unit(RunRequest::new(SourceUnitId(1))).await;
        assert_eq!(first, LaunchOutcome::Started(1000));
        assert_eq!(h.host.scheduler().pool().cold_starts(), 1);
        wait_for_spawns(&h.launcher, 2).await;
        assert!(h.host.scheduler().pool().is_hot(PrivilegeLevel::Normal));

        let spawned = h.launcher.spawned();
        assert_eq!(spawned[0].args[0], "helper");
        assert_eq!(spawned[0].args, spawned[1].args, "replacement listens on the same slot");

        // Warm start: the replacement takes the run.
        let second = h.host.run_unit(RunRequest::new(SourceUnitId(1))).await;
        assert_eq!(second, LaunchOutcome::Started(1001));
        assert_eq!(h.host.scheduler().pool().cold_starts(), 1);

        let launcher = h.launcher.clone();
        wait_until(|| launcher.handoffs().len() == 2).await;
        let handoffs = h.launcher.handoffs();
        let pids: Vec<u32> = handoffs.iter().map(|(pid, _)| *pid).collect();
        assert!(pids.contains(&1000) && pids.contains(&1001));
        for (_, message) in &handoffs {
            assert_eq!(message.unit, SourceUnitId(1));
            assert_eq!(message.artifact_path, h.artifact(1));
        }

        h.host.scheduler_mut().on_display_changed();
        assert!(!h.host.scheduler().pool().is_hot(PrivilegeLevel::Normal));

        Ok(())
    })
    .await
}

#[cfg(unix)]
#[tokio::test]
async fn non_preloaded_script_uses_a_one_shot_helper() -> TestResult {
    use taskhost::exec::PrivilegeLevel;

    with_timeout(async {
        init_tracing();
        let pipes = tempfile::tempdir()?;
        let cfg = ConfigFileBuilder::new()
            .with_unit(1, UnitConfigBuilder::new("script.sh").role(Role::Script).build())
            .pipe_dir(pipes.path())
            .preload(false)
            .privilege_control(false)
            .build();
        let mut h = Harness::new(cfg);

        let outcome = h.host.run_unit(RunRequest::new(SourceUnitId(1))).await;
        assert_eq!(outcome, LaunchOutcome::Started(1000));
        assert_eq!(h.host.scheduler().pool().cold_starts(), 0);
        assert!(!h.host.scheduler().pool().is_hot(PrivilegeLevel::Normal));

        let launcher = h.launcher.clone();
        wait_until(|| launcher.handoffs().len() == 1).await;
        assert_eq!(h.launcher.spawn_count(), 1);

        Ok(())
    })
    .await
}

#[cfg(unix)]
#[tokio::test]
async fn failed_replacement_falls_back_to_a_cold_start() -> TestResult {
    use taskhost::exec::PrivilegeLevel;

    with_timeout(async {
        init_tracing();
        let pipes = tempfile::tempdir()?;
        let mut h = Harness::new(preloaded_script(pipes.path()));
        // Spawn call 0 is the cold start, call 1 its replacement.
        h.launcher.fail_spawn(1);

        let first = h.host.run_unit(RunRequest::new(SourceUnitId(1))).await;
        assert_eq!(first, LaunchOutcome::Started(1000));

        let second = h.host.run_unit(RunRequest::new(SourceUnitId(1))).await;
        assert_eq!(second, LaunchOutcome::Started(1001));
        assert_eq!(h.host.scheduler().pool().cold_starts(), 2);

        let launcher = h.launcher.clone();
        wait_until(|| launcher.handoffs().iter().any(|(pid, _)| *pid == 1001)).await;
        wait_for_spawns(&h.launcher, 3).await;
        assert!(h.host.scheduler().pool().is_hot(PrivilegeLevel::Normal));

        Ok(())
    })
    .await
}

#[cfg(unix)]
#[tokio::test]
async fn dead_idle_helper_is_replaced_by_a_cold_start() -> TestResult {
    with_timeout(async {
        init_tracing();
        let pipes = tempfile::tempdir()?;
        let mut h = Harness::new(preloaded_script(pipes.path()));

        let first = h.host.run_unit(RunRequest::new(SourceUnitId(1))).await;
        assert_eq!(first, LaunchOutcome::Started(1000));
        wait_for_spawns(&h.launcher, 2).await;

        // The idle replacement dies before anyone claims it.
        h.launcher.exit(1001, 0);

        let second = h.host.run_unit(RunRequest::new(SourceUnitId(1))).await;
        assert_eq!(second, LaunchOutcome::Started(1002));
        assert_eq!(h.host.scheduler().pool().cold_starts(), 2);

        let launcher = h.launcher.clone();
        wait_until(|| launcher.handoffs().iter().any(|(pid, _)| *pid == 1002)).await;
        assert!(!h.launcher.handoffs().iter().any(|(pid, _)| *pid == 1001));

        Ok(())
    })
    .await
}

#[cfg(unix)]
#[tokio::test]
async fn failed_handoff_tears_the_slot_down() -> TestResult {
    use taskhost::exec::PrivilegeLevel;

    with_timeout(async {
        init_tracing();
        let pipes = tempfile::tempdir()?;
        let mut h = Harness::new(preloaded_script(pipes.path()));
        h.launcher.set_dead_helpers(true);

        let first = h.host.run_unit(RunRequest::new(SourceUnitId(1))).await;
        assert_eq!(first, LaunchOutcome::NotStarted);
        assert_eq!(h.launcher.spawn_count(), 1, "no replacement after a failed handoff");
        assert!(!h.host.scheduler().pool().is_hot(PrivilegeLevel::Normal));
        assert!(h.host.scheduler().is_idle());

        h.launcher.set_dead_helpers(false);
        let second = h.host.run_unit(RunRequest::new(SourceUnitId(1))).await;
        assert_eq!(second, LaunchOutcome::Started(1001));
        assert_eq!(h.host.scheduler().pool().cold_starts(), 2);

        Ok(())
    })
    .await
}

#[cfg(unix)]
#[tokio::test]
async fn dropping_the_host_kills_the_idle_helper() -> TestResult {
    with_timeout(async {
        init_tracing();
        let pipes = tempfile::tempdir()?;
        let Harness {
            mut host, launcher, ..
        } = Harness::new(preloaded_script(pipes.path()));

        let outcome = host.run_unit(RunRequest::new(SourceUnitId(1))).await;
        assert_eq!(outcome, LaunchOutcome::Started(1000));
        wait_for_spawns(&launcher, 2).await;
        assert!(launcher.is_alive(1001));

        drop(host);
        wait_until(|| !launcher.is_alive(1001)).await;

        Ok(())
    })
    .await
}
