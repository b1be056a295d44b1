use crate::*;

/// Fresh sessions spread over directors in proportion to their weights.
#[tokio::test]
async fn test_first_contact_follows_weights() {
    let gw = Gateway::build(
        &[("a", 5, "Messaging"), ("b", 3, "Messaging"), ("c", 2, "Messaging")],
        Mode::Silent,
        Duration::from_secs(1),
    );

    const SESSIONS: u64 = 5_000;
    for i in 0..SESSIONS {
        let s: SessionRef = FakeSession::new(i);
        gw.performer
            .transmit(&s, "Messaging", Envelope::new("pull"))
            .unwrap();
    }

    for (label, expected) in [("a", 0.5f64), ("b", 0.3), ("c", 0.2)] {
        let share = gw.director(label).sent_count() as f64 / SESSIONS as f64;
        assert!(
            (share - expected).abs() < 0.04,
            "director {label}: share {share}, expected {expected}"
        );
    }
    assert_eq!(gw.performer.affinity().len(), SESSIONS as usize);
}

/// Once pinned, a session keeps its director for every service, even
/// one that director does not advertise.
#[tokio::test]
async fn test_session_sticks_to_first_director() {
    let gw = Gateway::build(
        &[("auth", 1, "Auth"), ("msg", 1, "Messaging")],
        Mode::Silent,
        Duration::from_secs(1),
    );
    let s: SessionRef = FakeSession::new(1);

    gw.performer.transmit(&s, "Auth", Envelope::new("signIn")).unwrap();
    for _ in 0..10 {
        gw.performer
            .transmit(&s, "Messaging", Envelope::new("pull"))
            .unwrap();
    }

    assert_eq!(gw.director("auth").sent_count(), 11);
    assert_eq!(gw.director("msg").sent_count(), 0);
    let sent = gw.director("auth").sent.lock().unwrap();
    assert_eq!(sent.iter().filter(|(c, _)| c == "Messaging").count(), 10);
}

/// A service nobody advertises routes to the first registered director.
#[tokio::test]
async fn test_unadvertised_service_falls_back_to_first_director() {
    let gw = Gateway::build(
        &[("first", 1, "Auth"), ("second", 9, "Messaging")],
        Mode::Silent,
        Duration::from_secs(1),
    );

    for i in 0..20 {
        let s: SessionRef = FakeSession::new(i);
        gw.performer
            .transmit(&s, "FileStorage", Envelope::new("upload"))
            .unwrap();
    }
    assert_eq!(gw.director("first").sent_count(), 20);
    assert_eq!(gw.director("second").sent_count(), 0);
    assert_eq!(gw.performer.stats().snapshot().fallback_selections, 20);
}

/// Serial numbers are unique and increasing across all three send modes.
#[tokio::test]
async fn test_serial_numbers_are_unique_across_modes() {
    let gw = Gateway::build(&[("d1", 1, "Contact")], Mode::Echo, Duration::from_secs(2));
    let cellet: Arc<dyn Cellet> = RecordingCellet::new("Contact");
    let s: SessionRef = FakeSession::new(1);

    let a = gw.performer.transmit(&s, "Contact", Envelope::new("a")).unwrap();
    let b = gw.performer.transmit_tracked(&s, &cellet, Envelope::new("b")).unwrap();
    gw.performer
        .sync_transmit(&s, "Contact", Envelope::new("c"))
        .await
        .unwrap();
    let d = gw.performer.transmit(&s, "Contact", Envelope::new("d")).unwrap();

    assert!(a < b && b < d);
    let sns: Vec<u64> = gw
        .director("d1")
        .sent
        .lock()
        .unwrap()
        .iter()
        .map(|(_, e)| e.performer().unwrap().unwrap().sn)
        .collect();
    assert_eq!(sns.len(), 4);
    assert!(sns.windows(2).all(|w| w[0] < w[1]));
}
