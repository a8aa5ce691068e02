use super::*;

use std::sync::atomic::Ordering;

use shared::protocol::ServerEvent;
use tokio::sync::Notify;

use crate::test_support::{invitation, settle, MockBackend};

fn poller(backend: &Arc<MockBackend>) -> Arc<InvitationPoller> {
    InvitationPoller::new(
        Arc::clone(backend) as Arc<dyn ChatBackend>,
        Duration::from_secs(10),
    )
}

fn ids(poller: &InvitationPoller) -> Vec<i64> {
    poller.invitations().iter().map(|invitation| invitation.id.0).collect()
}

#[tokio::test(start_paused = true)]
async fn polls_on_a_fixed_interval_until_handle_is_dropped() {
    let backend = MockBackend::new();
    backend.set_invitations(vec![invitation(1, 5)]);
    let poller = poller(&backend);
    let dispatcher = EventDispatcher::new();

    let handle = poller.start(&dispatcher);
    settle().await;
    assert_eq!(backend.invitation_fetches.load(Ordering::SeqCst), 1);
    assert_eq!(ids(&poller), vec![1]);

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(backend.invitation_fetches.load(Ordering::SeqCst), 2);

    drop(handle);
    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(backend.invitation_fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn push_and_connect_events_trigger_refresh() {
    let backend = MockBackend::new();
    let poller = poller(&backend);
    let dispatcher = EventDispatcher::new();
    let _handle = poller.start(&dispatcher);
    settle().await;
    let baseline = backend.invitation_fetches.load(Ordering::SeqCst);

    backend.set_invitations(vec![invitation(4, 9)]);
    dispatcher.emit(&ServerEvent::RoomInvitation {
        room_id: RoomId(9),
        room_name: Some("team".into()),
        inviter_username: Some("alice".into()),
    });
    settle().await;
    assert_eq!(backend.invitation_fetches.load(Ordering::SeqCst), baseline + 1);
    assert_eq!(ids(&poller), vec![4]);

    dispatcher.emit(&ServerEvent::Connected {
        session_id: None,
        user_id: None,
    });
    settle().await;
    assert_eq!(backend.invitation_fetches.load(Ordering::SeqCst), baseline + 2);
}

#[tokio::test]
async fn accept_removes_locally_and_reports_room() {
    let backend = MockBackend::new();
    backend.set_invitations(vec![invitation(1, 5), invitation(2, 6)]);
    let poller = poller(&backend);
    poller.refresh().await.expect("refresh");

    let room = poller.accept(InvitationId(1)).await.expect("accept");

    assert_eq!(room, Some(RoomId(5)));
    assert_eq!(ids(&poller), vec![2]);
}

#[tokio::test]
async fn failed_accept_or_reject_leaves_list_untouched() {
    let backend = MockBackend::new();
    backend.set_invitations(vec![invitation(1, 5)]);
    let poller = poller(&backend);
    poller.refresh().await.expect("refresh");
    *backend.fail_invitation_calls.lock().unwrap() = true;

    let err = poller.accept(InvitationId(1)).await.expect_err("accept");
    assert_eq!(
        err,
        SyncError::InvitationFailed {
            invitation_id: InvitationId(1),
            reason: "Invitation expired".into()
        }
    );
    assert!(poller.reject(InvitationId(1)).await.is_err());
    assert_eq!(ids(&poller), vec![1]);
}

#[tokio::test]
async fn reject_removes_locally() {
    let backend = MockBackend::new();
    backend.set_invitations(vec![invitation(1, 5)]);
    let poller = poller(&backend);
    poller.refresh().await.expect("refresh");

    poller.reject(InvitationId(1)).await.expect("reject");

    assert!(poller.invitations().is_empty());
}

#[tokio::test]
async fn in_flight_refresh_does_not_resurrect_accepted_invitation() {
    let backend = MockBackend::new();
    backend.set_invitations(vec![invitation(1, 5), invitation(2, 6)]);
    let poller = poller(&backend);
    poller.refresh().await.expect("refresh");

    let gate = Arc::new(Notify::new());
    *backend.invitation_gate.lock().unwrap() = Some(Arc::clone(&gate));
    let in_flight = {
        let poller = Arc::clone(&poller);
        tokio::spawn(async move { poller.refresh().await })
    };
    settle().await;

    poller.accept(InvitationId(1)).await.expect("accept");
    gate.notify_one();
    in_flight.await.expect("task").expect("refresh");

    assert_eq!(ids(&poller), vec![2]);
}
