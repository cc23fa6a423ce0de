//! The in-memory lease registry: enforces name uniqueness, TTL expiry, and
//! connection-scoped ownership behind a single command-loop actor, with a
//! deletion callback fanned out once per destroyed lease.

#[macro_use]
extern crate tracing;

mod lease;
mod manager;

pub use lease::{ConnectionId, DeleteOutcome, Lease, LeaseEntry, UNNAMED_SENTINEL, UpdateOutcome};
pub use manager::{DeletionCallback, LeaseManagerHandle, LeaseManagerTask};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use relay_identity::Identity;
    use relay_task::{Task, spawn_task};
    use time::OffsetDateTime;

    use super::*;

    fn lease(identity: &str, name: Option<&str>) -> Lease {
        Lease {
            identity: Identity::from(identity),
            name: name.map(str::to_owned),
            alpn: vec!["test-proto".to_owned()],
            metadata: None,
            reverse_token: "token".to_owned(),
            expires_at: OffsetDateTime::now_utc() + time::Duration::seconds(60),
        }
    }

    async fn spawn_manager() -> (LeaseManagerHandle, relay_task::ChildTask<anyhow::Result<()>>, relay_task::ShutdownHandle) {
        let manager = LeaseManagerTask::with_tick_interval(None, Duration::from_millis(20));
        let handle = manager.handle();
        let (shutdown, signal) = relay_task::ShutdownHandle::new();
        let task = spawn_task(manager, signal);
        (handle, task, shutdown)
    }

    #[tokio::test]
    async fn update_then_get_by_identity() {
        let (handle, _task, _shutdown) = spawn_manager().await;

        let outcome = handle
            .update(lease("H", Some("test-service")), ConnectionId(1))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Accepted);

        let entry = handle.get_by_identity(Identity::from("H")).await.unwrap().unwrap();
        assert_eq!(entry.lease.name.as_deref(), Some("test-service"));
    }

    #[tokio::test]
    async fn name_conflict_is_rejected() {
        let (handle, _task, _shutdown) = spawn_manager().await;

        let a = handle
            .update(lease("A", Some("duplicate-service")), ConnectionId(1))
            .await
            .unwrap();
        assert_eq!(a, UpdateOutcome::Accepted);

        let b = handle
            .update(lease("B", Some("duplicate-service")), ConnectionId(2))
            .await
            .unwrap();
        assert_eq!(b, UpdateOutcome::Rejected);

        let entry = handle.get_by_name("duplicate-service".to_owned()).await.unwrap().unwrap();
        assert_eq!(entry.lease.identity, Identity::from("A"));
    }

    #[tokio::test]
    async fn update_by_different_owner_is_invalid() {
        let (handle, _task, _shutdown) = spawn_manager().await;

        handle.update(lease("H", None), ConnectionId(1)).await.unwrap();
        let outcome = handle.update(lease("H", None), ConnectionId(2)).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Invalid);
    }

    #[tokio::test]
    async fn delete_by_non_owner_is_invalid() {
        let (handle, _task, _shutdown) = spawn_manager().await;

        handle.update(lease("H", None), ConnectionId(1)).await.unwrap();
        let outcome = handle.delete(Identity::from("H"), ConnectionId(2)).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Invalid);

        let outcome = handle.delete(Identity::from("H"), ConnectionId(1)).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Accepted);
    }

    #[tokio::test]
    async fn deletion_callback_fires_once_on_expiry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let callback: DeletionCallback = Arc::new(move |_identity| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        });

        let manager = LeaseManagerTask::with_tick_interval(Some(callback), Duration::from_millis(20));
        let handle = manager.handle();
        let (shutdown, signal) = relay_task::ShutdownHandle::new();
        let _task = spawn_task(manager, signal);

        let mut short_lease = lease("H", None);
        short_lease.expires_at = OffsetDateTime::now_utc() + time::Duration::milliseconds(10);
        handle.update(short_lease, ConnectionId(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handle.get_by_identity(Identity::from("H")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_by_connection_removes_owned_leases() {
        let (handle, _task, _shutdown) = spawn_manager().await;

        handle.update(lease("H1", None), ConnectionId(1)).await.unwrap();
        handle.update(lease("H2", None), ConnectionId(1)).await.unwrap();
        handle.update(lease("H3", None), ConnectionId(2)).await.unwrap();

        let removed = handle.cleanup_by_connection(ConnectionId(1)).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&Identity::from("H1")));
        assert!(removed.contains(&Identity::from("H2")));

        assert!(handle.get_by_identity(Identity::from("H1")).await.unwrap().is_none());
        assert!(handle.get_by_identity(Identity::from("H2")).await.unwrap().is_none());
        assert!(handle.get_by_identity(Identity::from("H3")).await.unwrap().is_some());
    }
}
