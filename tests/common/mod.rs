//! Shared behavioral suite for container backends.
//!
//! Each backend's test file connects its runtime and calls [`run_suite`];
//! the assertions here only rely on the backend-neutral contract, so every
//! backend must pass them unchanged.

use chrono::Utc;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use unirun::logging::LogReader;
use unirun::{
    Container, ContainerOpts, ContainerStatus, DockerImage, Error, Mount, PullPolicy, Runtime,
};

const BUSYBOX: &str = "docker.io/busybox:latest";

/// Polls a container until it exits, failing after a grace period.
async fn await_exit(ctr: &dyn Container) -> unirun::ContainerInfo {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        assert!(Instant::now() < deadline, "container did not exit in time");
        let info = ctr.info().await.expect("info while awaiting exit");
        if info.status == Some(ContainerStatus::Exited) {
            return info;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Polls a container until its process is live. Keeps stop scenarios from
/// racing a backend that is still setting the container up.
async fn await_running(ctr: &dyn Container) {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        assert!(Instant::now() < deadline, "container did not start in time");
        let info = ctr.info().await.expect("info while awaiting start");
        if info.status == Some(ContainerStatus::Running) && info.started_at.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Runs the full behavioral suite against a live backend.
pub async fn run_suite(rt: &dyn Runtime) {
    let _ = rt
        .pull_image(&DockerImage::new(BUSYBOX), PullPolicy::IfMissing, true)
        .await;

    create_and_inspect(rt).await;
    full_lifecycle(rt).await;
    list_containers(rt).await;
    container_stop(rt).await;
    forbidden_keys(rt).await;
    missing_container(rt).await;
}

/// Creation with minimal opts yields a created, introspectable container.
async fn create_and_inspect(rt: &dyn Runtime) {
    let ctr = rt
        .create_container(&ContainerOpts {
            image: DockerImage::new(BUSYBOX),
            command: vec!["sleep".to_string(), "60".to_string()],
            labels: HashMap::from([("suite".to_string(), "create".to_string())]),
            ..Default::default()
        })
        .await
        .expect("create");

    assert!(!ctr.name().is_empty());

    let info = ctr.info().await.expect("info");
    assert!(info.created_at.is_some());
    assert_eq!(
        info.labels.get("suite").map(String::as_str),
        Some("create"),
        "user labels survive the round trip"
    );
    assert!(
        info.status == Some(ContainerStatus::Created)
            || info.status == Some(ContainerStatus::Running),
        "fresh container is created or already running, got {:?}",
        info.status
    );
    assert!(info.exit_code.is_none());

    ctr.remove().await.expect("remove");
}

/// Start-to-exit flow: status transitions, exit code, and log content.
async fn full_lifecycle(rt: &dyn Runtime) {
    let started = Utc::now();
    let ctr = rt
        .create_container(&ContainerOpts {
            image: DockerImage::new(BUSYBOX),
            command: vec!["/bin/sh".to_string(), "-c".to_string()],
            arguments: vec!["echo one; echo two 1>&2; exit 3".to_string()],
            env: HashMap::from([("PLANET".to_string(), "Earth".to_string())]),
            mounts: vec![Mount {
                host_path: "/tmp".to_string(),
                container_path: "/dummy".to_string(),
                read_only: true,
            }],
            memory: 16 * 1024 * 1024,
            ..Default::default()
        })
        .await
        .expect("create");

    ctr.start().await.expect("start");
    let info = await_exit(ctr.as_ref()).await;
    assert_eq!(info.exit_code, Some(3));
    if let (Some(started_at), Some(ended_at)) = (info.started_at, info.ended_at) {
        assert!(ended_at >= started_at);
        assert!(started_at >= info.created_at.expect("created_at"));
    }

    // All emitted messages arrive, in order, with timestamps no older than
    // the container itself.
    let mut logs = ctr.logs(None).await.expect("logs");
    let mut texts = Vec::new();
    let mut last_time = None;
    while let Some(msg) = logs.read_message().await.expect("read message") {
        assert!(msg.time >= started - chrono::Duration::seconds(5));
        if let Some(prev) = last_time {
            assert!(msg.time >= prev, "log times regressed");
        }
        last_time = Some(msg.time);
        texts.push(msg.text);
    }
    assert!(texts.iter().any(|t| t.starts_with("one")));
    assert!(texts.iter().any(|t| t.starts_with("two")));

    ctr.remove().await.expect("remove");
}

/// Created containers show up in the managed listing until removed.
async fn list_containers(rt: &dyn Runtime) {
    let mut created = Vec::new();
    for _ in 0..2 {
        created.push(
            rt.create_container(&ContainerOpts {
                image: DockerImage::new(BUSYBOX),
                command: vec!["sleep".to_string(), "60".to_string()],
                ..Default::default()
            })
            .await
            .expect("create"),
        );
    }

    match rt.list_containers().await {
        Ok(listed) => {
            let names: Vec<&str> = listed.iter().map(|c| c.name()).collect();
            for ctr in &created {
                assert!(
                    names.contains(&ctr.name()),
                    "listing is missing {}",
                    ctr.name()
                );
            }
        }
        // CRI has no listing; everything else must enumerate.
        Err(Error::NotImplemented) => {
            for ctr in &created {
                ctr.remove().await.expect("remove");
            }
            return;
        }
        Err(e) => panic!("list failed: {e}"),
    }

    for ctr in &created {
        ctr.remove().await.expect("remove");
    }
    // Controllers drop removed containers asynchronously; poll for the
    // listing to settle.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let listed = rt.list_containers().await.expect("list after remove");
        let names: Vec<&str> = listed.iter().map(|c| c.name()).collect();
        if created.iter().all(|ctr| !names.contains(&ctr.name())) {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "removed containers still listed: {names:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Stop takes down a long-running container: a zero timeout kills it
/// outright, and an elapsed grace period escalates from SIGTERM to SIGKILL.
async fn container_stop(rt: &dyn Runtime) {
    // Zero timeout: no grace period, straight to SIGKILL.
    let ctr = rt
        .create_container(&ContainerOpts {
            image: DockerImage::new(BUSYBOX),
            command: vec!["sleep".to_string(), "600".to_string()],
            ..Default::default()
        })
        .await
        .expect("create");
    ctr.start().await.expect("start");
    await_running(ctr.as_ref()).await;

    ctr.stop(Some(Duration::ZERO)).await.expect("stop");
    let info = await_exit(ctr.as_ref()).await;
    assert_eq!(info.status, Some(ContainerStatus::Exited));
    ctr.remove().await.expect("remove");

    // A shell ignoring SIGTERM only dies once the grace period elapses and
    // SIGKILL lands.
    let ctr = rt
        .create_container(&ContainerOpts {
            image: DockerImage::new(BUSYBOX),
            command: vec!["/bin/sh".to_string(), "-c".to_string()],
            arguments: vec!["trap '' TERM; sleep 600".to_string()],
            ..Default::default()
        })
        .await
        .expect("create");
    ctr.start().await.expect("start");
    await_running(ctr.as_ref()).await;

    ctr.stop(Some(Duration::from_secs(1))).await.expect("stop");
    let info = await_exit(ctr.as_ref()).await;
    assert_eq!(info.status, Some(ContainerStatus::Exited));
    if let Some(code) = info.exit_code {
        assert_ne!(code, 0, "a killed container does not exit cleanly");
    }
    ctr.remove().await.expect("remove");
}

/// Reserved env and label keys are refused before any side effect.
async fn forbidden_keys(rt: &dyn Runtime) {
    let env_opts = ContainerOpts {
        image: DockerImage::new(BUSYBOX),
        env: HashMap::from([("NVIDIA_VISIBLE_DEVICES".to_string(), "all".to_string())]),
        ..Default::default()
    };
    assert!(matches!(
        rt.create_container(&env_opts).await.map(|_| ()),
        Err(Error::InvalidInput(_))
    ));

    let label_opts = ContainerOpts {
        image: DockerImage::new(BUSYBOX),
        labels: HashMap::from([("unirun.dev/managed".to_string(), "true".to_string())]),
        ..Default::default()
    };
    assert!(matches!(
        rt.create_container(&label_opts).await.map(|_| ()),
        Err(Error::InvalidInput(_))
    ));
}

/// Operations on a removed container surface NotFound.
async fn missing_container(rt: &dyn Runtime) {
    let ctr = rt
        .create_container(&ContainerOpts {
            image: DockerImage::new(BUSYBOX),
            command: vec!["sleep".to_string(), "60".to_string()],
            ..Default::default()
        })
        .await
        .expect("create");

    ctr.remove().await.expect("remove");
    assert!(matches!(ctr.info().await.map(|_| ()), Err(Error::NotFound)));
    assert!(matches!(ctr.remove().await, Err(Error::NotFound)));
}
