#[allow(dead_code)]
mod common;

use std::time::Duration;

use tokio::time::Instant;

use blindpair_core::error::MatchError;
use blindpair_core::profile::Profile;
use blindpair_core::state::{ConnectionStatus, Notice, SessionState};

use blindpair_session::{SessionEvent, StartOutcome};
use common::{TestWorld, expect_event, pair, pair_with_passive, unique_uid, wait_for_state};

#[tokio::test(start_paused = true)]
async fn two_users_pair_into_one_room() {
    let world = TestWorld::new();
    let ana = world.spawn_user(&unique_uid("ana"));
    let ben = world.spawn_user(&unique_uid("ben"));

    let (sa, sb) = pair(&world, &ana, &ben).await;

    assert_eq!(sa.room_id, sb.room_id);
    assert_eq!(sa.partner.as_ref().unwrap().uid, ben.uid());
    assert_eq!(sb.partner.as_ref().unwrap().uid, ana.uid());
    assert_eq!(sa.time_left_secs, 300);
    assert_eq!(sa.connection, ConnectionStatus::Connected);

    let ra = world.record(ana.uid()).unwrap();
    let rb = world.record(ben.uid()).unwrap();
    assert_eq!(ra.room_id, rb.room_id);
    assert!(!world.in_queue(ana.uid()));
    assert!(!world.in_queue(ben.uid()));
}

#[tokio::test(start_paused = true)]
async fn second_start_is_already_active() {
    let world = TestWorld::new();
    let ana = world.spawn_user(&unique_uid("ana"));
    assert_eq!(ana.start_matching().await.unwrap(), StartOutcome::Started);
    assert_eq!(
        ana.start_matching().await.unwrap(),
        StartOutcome::AlreadyActive
    );
    assert_eq!(ana.snapshot().state, SessionState::Searching);
}

#[tokio::test(start_paused = true)]
async fn unverified_user_rejected() {
    let world = TestWorld::new();
    let uid = unique_uid("ana");
    let ana = world.spawn_with_profile(&uid, Some(Profile::new(uid.as_str(), "Ana")));

    let err = ana.start_matching().await.unwrap_err();
    assert_eq!(err, MatchError::VerificationRequired);
    let snap = ana.snapshot();
    assert_eq!(snap.state, SessionState::Idle);
    assert_eq!(snap.notice, Some(Notice::VerificationRequired));
    assert!(!world.in_queue(&uid));
}

#[tokio::test(start_paused = true)]
async fn missing_profile_rejected() {
    let world = TestWorld::new();
    let uid = unique_uid("nobody");
    let handle = world.spawn_with_profile(&uid, None);
    let err = handle.start_matching().await.unwrap_err();
    assert_eq!(err, MatchError::ProfileUnavailable(uid));
    assert_eq!(handle.snapshot().notice, Some(Notice::ProfileUnavailable));
}

#[tokio::test(start_paused = true)]
async fn search_times_out_after_thirty_seconds() {
    let world = TestWorld::new();
    let ana = world.spawn_user(&unique_uid("ana"));
    let mut events = ana.events();
    let started = Instant::now();

    ana.start_matching().await.unwrap();
    world.wait_queued(ana.uid()).await;

    let snap = wait_for_state(&ana, SessionState::Idle, 40).await;
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(snap.notice, Some(Notice::SearchTimeout));
    assert!(Notice::SearchTimeout.is_retryable());
    assert!(!world.in_queue(ana.uid()));
    expect_event(&mut events, 1, |e| {
        *e == SessionEvent::Notice(Notice::SearchTimeout)
    })
    .await;

    // retry is allowed
    assert_eq!(ana.start_matching().await.unwrap(), StartOutcome::Started);
}

#[tokio::test(start_paused = true)]
async fn cancel_leaves_queue() {
    let world = TestWorld::new();
    let ana = world.spawn_user(&unique_uid("ana"));
    ana.start_matching().await.unwrap();
    world.wait_queued(ana.uid()).await;

    ana.cancel().await.unwrap();

    let snap = ana.snapshot();
    assert_eq!(snap.state, SessionState::Idle);
    assert_eq!(snap.notice, None);
    assert!(!world.in_queue(ana.uid()));

    // the cancelled search must not fire later
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(ana.snapshot().notice, None);
}

#[tokio::test(start_paused = true)]
async fn stale_queue_entries_are_ignored() {
    let world = TestWorld::new();
    let old = unique_uid("old");
    blindpair_core::test_helpers::seed_queue_entry(
        &world.store,
        &old,
        blindpair_core::time::now_millis() - 60_000,
    );
    let ana = world.spawn_user(&unique_uid("ana"));
    ana.start_matching().await.unwrap();
    world.wait_queued(ana.uid()).await;
    assert_eq!(ana.snapshot().state, SessionState::Searching);
    assert!(world.record(&old).is_none());
}

#[tokio::test(start_paused = true)]
async fn partial_write_failure_self_heals() {
    let world = TestWorld::new();
    let bob = unique_uid("bob");
    world.store.fail_writes(&format!("matches/{bob}"));
    let ana = world.spawn_user(&unique_uid("ana"));
    let mut events = ana.events();

    pair_with_passive(&world, &ana, &bob).await;
    expect_event(&mut events, 5, |e| {
        *e == SessionEvent::Notice(Notice::PartialWriteFailure)
    })
    .await;

    // partner never got a record, so the watch reports them gone
    expect_event(&mut events, 5, |e| {
        *e == SessionEvent::Notice(Notice::PartnerLeft)
    })
    .await;
    let snap = wait_for_state(&ana, SessionState::Idle, 5).await;
    assert_eq!(snap.notice, Some(Notice::PartnerLeft));
    assert!(world.record(ana.uid()).is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_own_write_returns_to_idle() {
    let world = TestWorld::new();
    let ana_uid = unique_uid("ana");
    world.store.fail_writes(&format!("matches/{ana_uid}"));
    world.seed_waiting(&unique_uid("bob"));
    let ana = world.spawn_user(&ana_uid);

    ana.start_matching().await.unwrap();
    let snap = wait_for_state(&ana, SessionState::Idle, 5).await;
    assert_eq!(snap.notice, Some(Notice::PartialWriteFailure));
}

#[tokio::test(start_paused = true)]
async fn dismiss_clears_notice() {
    let world = TestWorld::new();
    let uid = unique_uid("ana");
    let ana = world.spawn_with_profile(&uid, Some(Profile::new(uid.as_str(), "Ana")));
    let _ = ana.start_matching().await;
    assert!(ana.snapshot().notice.is_some());

    ana.dismiss_notice().unwrap();
    let mut rx = ana.watch();
    rx.wait_for(|s| s.notice.is_none()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn verification_rechecked_after_skip() {
    let world = TestWorld::new();
    let ana = world.spawn_user(&unique_uid("ana"));
    let ben = world.spawn_user(&unique_uid("ben"));
    pair(&world, &ana, &ben).await;

    world.directory.set_verified(ana.uid(), false);
    ana.skip().await.unwrap();
    let snap = wait_for_state(&ana, SessionState::Idle, 5).await;
    assert_eq!(snap.notice, Some(Notice::VerificationRequired));
}

#[tokio::test(start_paused = true)]
async fn shutdown_while_searching_leaves_queue() {
    let world = TestWorld::new();
    let ana = world.spawn_user(&unique_uid("ana"));
    ana.start_matching().await.unwrap();
    world.wait_queued(ana.uid()).await;

    ana.shutdown().await;

    assert!(!world.in_queue(ana.uid()));
    assert_eq!(
        ana.start_matching().await.unwrap_err(),
        MatchError::ControllerClosed
    );
}
