use crate::*;

use cube_core::envelope::DIRECTOR_KEY;
use cube_dispatch::{Contact, Device, DispatchError};

/// Tracked relay: the echo reply reaches the originating session exactly
/// once, without its correlation record, and leaves nothing pending.
#[tokio::test]
async fn test_tracked_relay_round_trip() {
    let gw = Gateway::build(&[("d1", 5, "Contact, Messaging")], Mode::Echo, Duration::from_secs(2));
    let recorder = RecordingCellet::new("Messaging");
    let cellet: Arc<dyn Cellet> = recorder.clone();

    let alice: SessionRef = FakeSession::new(1);
    let bob: SessionRef = FakeSession::new(2);
    gw.performer
        .transmit_tracked(&alice, &cellet, Envelope::new("pull"))
        .unwrap();
    gw.performer
        .transmit_tracked(&bob, &cellet, Envelope::new("pull"))
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || recorder.delivered_count() == 2).await);
    assert!(wait_until(Duration::from_secs(1), || gw.performer.pending_transmissions() == 0).await);

    let delivered = recorder.delivered.lock().unwrap();
    let mut sessions: Vec<u64> = delivered.iter().map(|(id, _)| id.0).collect();
    sessions.sort();
    assert_eq!(sessions, vec![1, 2]);
    for (_, reply) in delivered.iter() {
        assert!(reply.param(PERFORMER_KEY).is_none());
        assert_eq!(reply.param("director"), Some(&json!("d1")));
    }
}

/// Concurrent blocking calls each get their own reply back.
#[tokio::test]
async fn test_concurrent_blocking_calls_are_correlated() {
    let gw = Gateway::build(&[("d1", 1, "Auth")], Mode::Echo, Duration::from_secs(2));

    let mut tasks = Vec::new();
    for i in 0..32u64 {
        let performer = gw.performer.clone();
        tasks.push(tokio::spawn(async move {
            let s: SessionRef = FakeSession::new(i);
            let action = format!("call-{i}");
            let reply = performer
                .sync_transmit(&s, "Auth", Envelope::new(action.clone()))
                .await
                .unwrap();
            assert_eq!(reply.name, action);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(gw.director("d1").sent_count(), 32);
    assert_eq!(gw.performer.pending_blocks(), 0);
    assert_eq!(gw.performer.stats().snapshot().timeouts, 0);
}

/// A silent director makes the blocking call time out near the bound and
/// a late reply is then an orphan.
#[tokio::test]
async fn test_blocking_call_times_out_then_late_reply_is_orphaned() {
    let timeout = Duration::from_millis(80);
    let gw = Gateway::build(&[("d1", 1, "Auth")], Mode::Silent, timeout);
    let s: SessionRef = FakeSession::new(1);

    let started = Instant::now();
    let err = gw
        .performer
        .sync_transmit(&s, "Auth", Envelope::new("signIn"))
        .await
        .unwrap_err();
    let waited = started.elapsed();
    assert!(matches!(err, DispatchError::Timeout { sn, .. } if sn > 0));
    assert!(waited >= timeout && waited < timeout + Duration::from_millis(500));
    assert_eq!(gw.performer.pending_blocks(), 0);

    let sent = gw.director("d1").sent.lock().unwrap()[0].1.clone();
    let late = Envelope::new("signIn")
        .with_param(PERFORMER_KEY, sent.param(PERFORMER_KEY).unwrap().clone());
    gw.performer.on_received("Auth", late);
    assert_eq!(gw.performer.stats().snapshot().orphaned_replies, 1);
}

/// No director for the cellet and none to fall back to.
#[tokio::test]
async fn test_relay_without_directors_fails_fast() {
    let gw = Gateway::build(&[], Mode::Echo, Duration::from_secs(5));
    let s: SessionRef = FakeSession::new(1);

    let started = Instant::now();
    let err = gw
        .performer
        .sync_transmit(&s, "Auth", Envelope::new("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoDirector(ref c) if c == "Auth"));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(gw.performer.affinity().is_empty());
}

/// A director push reaches each online device of the recipient through
/// the cellet named by the service it arrived on.
#[tokio::test]
async fn test_push_fans_out_to_online_devices() {
    let gw = Gateway::build(&[("d1", 1, "Messaging")], Mode::Echo, Duration::from_secs(1));
    let messaging = RecordingCellet::new("Messaging");
    let contact_cellet = RecordingCellet::new("Contact");
    gw.performer.add_cellet(messaging.clone());
    gw.performer.add_cellet(contact_cellet.clone());

    let phone = FakeSession::new(10);
    let laptop = FakeSession::new(11);
    let mut contact = Contact::new(2002, "shixincube.com", "Bob");
    contact.add_device(Device::new("iPhone", "iOS", phone.clone()));
    contact.add_device(Device::new("Chrome", "Web", laptop.clone()));
    gw.performer.presence().add_contact(contact);

    let push = Envelope::new("notify")
        .with_param(DIRECTOR_KEY, json!({ "id": 2002 }))
        .with_param("message", json!({ "text": "hi" }));
    gw.performer.on_received("Messaging", push.clone());

    assert_eq!(messaging.delivered_count(), 2);
    assert_eq!(contact_cellet.delivered_count(), 0);

    laptop.fail_at(Instant::now());
    gw.performer.on_received("Messaging", push);
    assert_eq!(messaging.delivered_count(), 3);
    let last = messaging.delivered.lock().unwrap().last().unwrap().clone();
    assert_eq!(last.0, SessionId(10));
    assert!(last.1.param(DIRECTOR_KEY).is_none());
}
