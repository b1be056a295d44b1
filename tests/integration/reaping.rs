use crate::*;

use cube_core::config::DispatcherConfig;
use cube_dispatch::reaper::{CONTACT_CELLET, DEVICE_TIMEOUT};
use cube_dispatch::{Contact, Device, LogBuffer, Reaper, ReaperSettings, Report, ReportSink};
use tokio::sync::broadcast;

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<Report>>,
}

impl ReportSink for RecordingSink {
    fn submit(&self, report: &Report) -> Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

impl RecordingSink {
    fn process_reports(&self) -> usize {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| matches!(r, Report::Process(_)))
            .count()
    }
}

const CONFIG: &str = r#"
[node]
name = "dispatcher-it"

[daemon]
device_timeout_secs = 30
transmission_timeout_secs = 10

[[directors]]
address = "10.2.0.1"
cellets = "Auth, Contact"
weight = 4

[[directors]]
address = "10.2.0.2"
cellets = "Messaging"
weight = 6
"#;

fn config_from_file() -> DispatcherConfig {
    let path = std::env::temp_dir().join(format!("cube-it-{}.toml", std::process::id()));
    std::fs::write(&path, CONFIG).unwrap();
    let config = DispatcherConfig::from_file(&path).unwrap();
    let _ = std::fs::remove_file(&path);
    config
}

/// Gateway wired from the `[[directors]]` entries, labelled by address.
fn gateway_from(config: &DispatcherConfig) -> Gateway {
    let entries: Vec<(String, u32, String)> = config
        .directors
        .iter()
        .map(|d| {
            let names: Vec<String> = d.cellet_names().unwrap().into_iter().collect();
            (d.address.clone(), d.weight, names.join(","))
        })
        .collect();
    let borrowed: Vec<(&str, u32, &str)> = entries
        .iter()
        .map(|(a, w, c)| (a.as_str(), *w, c.as_str()))
        .collect();
    Gateway::build(&borrowed, Mode::Silent, config.performer.block_timeout())
}

/// A device whose session dropped is kept through the grace window, then
/// removed with a `deviceTimeout` notice to the Contact service.
#[test]
fn test_device_timeout_after_grace_window() {
    let config = config_from_file();
    let gw = gateway_from(&config);
    let settings = ReaperSettings::from_config(config.node.name.clone(), &config.daemon);
    let sink = Arc::new(RecordingSink::default());
    let reaper = Reaper::new(gw.performer.clone(), settings, sink.clone(), LogBuffer::new());

    let phone = FakeSession::new(1);
    let desk = FakeSession::new(2);
    let mut contact = Contact::new(3003, "shixincube.com", "Carol");
    contact.add_device(Device::new("iPhone", "iOS", phone.clone()).with_token("t-phone"));
    contact.add_device(Device::new("Chrome", "Web", desk.clone()));
    gw.performer.presence().add_contact(contact);

    let t0 = Instant::now();
    phone.fail_at(t0);

    let summary = reaper.sweep(t0 + Duration::from_secs(29));
    assert_eq!(summary.expired_devices, 0);
    assert_eq!(gw.performer.presence().contact(3003).unwrap().devices.len(), 2);

    let summary = reaper.sweep(t0 + Duration::from_secs(31));
    assert_eq!(summary.expired_devices, 1);
    assert_eq!(summary.timeout_notices, 1);

    let devices = gw.performer.presence().contact(3003).unwrap().devices;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name, "Chrome");

    // Only 10.2.0.1 offers Contact.
    let contact_director = gw.director("10.2.0.1");
    let sent = contact_director.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (cellet, notice) = &sent[0];
    assert_eq!(cellet, CONTACT_CELLET);
    assert_eq!(notice.name, DEVICE_TIMEOUT);
    assert_eq!(notice.param("token"), Some(&json!("t-phone")));
    let data = notice.param("data").unwrap();
    assert_eq!(data["id"], 3003);
    assert_eq!(data["domain"], "shixincube.com");
    assert_eq!(data["device"]["platform"], "iOS");
    assert!(data["failureTime"].as_u64().unwrap() > 0);

    assert!(gw.performer.affinity().get(SessionId(1)).is_none());
    assert_eq!(gw.director("10.2.0.2").sent_count(), 0);
}

/// The daemon loop sweeps on its period and stops on shutdown.
#[tokio::test]
async fn test_reaper_loop_reports_and_stops() {
    let gw = Gateway::build(&[("d1", 1, "Contact")], Mode::Silent, Duration::from_secs(1));
    let settings = ReaperSettings {
        node: "dispatcher-it".into(),
        interval: Duration::from_millis(20),
        device_timeout: Duration::from_secs(30),
        transmission_timeout: Duration::from_millis(50),
        report_interval: Duration::from_secs(60),
    };
    let sink = Arc::new(RecordingSink::default());
    let reaper = Arc::new(Reaper::new(
        gw.performer.clone(),
        settings,
        sink.clone(),
        LogBuffer::new(),
    ));

    let cellet: Arc<dyn Cellet> = RecordingCellet::new("Contact");
    let s: SessionRef = FakeSession::new(1);
    gw.performer
        .transmit_tracked(&s, &cellet, Envelope::new("getContact"))
        .unwrap();

    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = tokio::spawn(reaper.run(shutdown_tx.subscribe()));

    assert!(wait_until(Duration::from_secs(2), || gw.performer.pending_transmissions() == 0).await);
    assert_eq!(sink.process_reports(), 1);
    assert_eq!(gw.performer.stats().snapshot().expired_transmissions, 1);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("reaper did not stop")
        .unwrap();
}
