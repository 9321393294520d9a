//! Supervisor shutdown behaviour.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oracle::shutdown::Shutdown;
use oracle::supervisor::Supervisor;

#[tokio::test]
async fn test_first_failure_cancels_other_workers() {
    let shutdown = Shutdown::new();
    let mut supervisor = Supervisor::new(shutdown.clone());
    let observed_cancel = Arc::new(AtomicBool::new(false));

    let flag = observed_cancel.clone();
    let worker_shutdown = shutdown.clone();
    supervisor.spawn("steady", async move {
        worker_shutdown.cancelled().await;
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    supervisor.spawn("failing", async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err(eyre::eyre!("subscription permanently closed"))
    });

    let result = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
        .await
        .unwrap();
    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("subscription permanently closed"));
    assert!(observed_cancel.load(Ordering::SeqCst));
    assert!(shutdown.is_triggered());
}

#[tokio::test]
async fn test_signal_shutdown_is_clean() {
    let shutdown = Shutdown::new();
    let mut supervisor = Supervisor::new(shutdown.clone());
    for name in ["evm", "solana"] {
        let s = shutdown.clone();
        supervisor.spawn(name, async move {
            s.cancelled().await;
            Ok(())
        });
    }
    assert_eq!(supervisor.len(), 2);

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.trigger();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
        .await
        .unwrap();
    tokio_test::assert_ok!(result);
}

#[tokio::test]
async fn test_silent_exit_is_a_failure() {
    let shutdown = Shutdown::new();
    let mut supervisor = Supervisor::new(shutdown.clone());
    supervisor.spawn("quitter", async { Ok(()) });
    let s = shutdown.clone();
    supervisor.spawn("steady", async move {
        s.cancelled().await;
        Ok(())
    });

    let err = supervisor.run().await.unwrap_err();
    assert!(err.to_string().contains("quitter"));
}

#[tokio::test]
async fn test_stuck_worker_is_aborted_after_grace() {
    let shutdown = Shutdown::new();
    let mut supervisor = Supervisor::new(shutdown.clone()).with_grace(Duration::from_millis(20));
    supervisor.spawn("stuck", async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    });
    shutdown.trigger();

    let result = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
        .await
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_worker_panic_is_reported() {
    let shutdown = Shutdown::new();
    let mut supervisor = Supervisor::new(shutdown);
    supervisor.spawn("panicky", async {
        let fail = true;
        if fail {
            panic!("boom");
        }
        Ok(())
    });
    assert!(supervisor.run().await.is_err());
}
