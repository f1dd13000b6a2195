use probejob_core::{
    ChannelDirection, Dispatcher, DispatcherConfig, EraseMode, Job, JobEvent, MockDriver, OutputValue,
    ProgressUpdate, ResultCode, RttConnection,
};
use tokio::time::{timeout, Duration};

const CONTROL_BLOCK: u32 = 0x2000_1000;

fn rtt_driver() -> MockDriver {
    MockDriver::new().with_rtt_control_block(CONTROL_BLOCK, &[("Terminal", 1024), ("Log", 256)], &[("Terminal", 16)])
}

async fn next_event(receiver: &mut tokio::sync::broadcast::Receiver<JobEvent>) -> JobEvent {
    timeout(Duration::from_millis(500), receiver.recv())
        .await
        .expect("Timeout waiting for job event")
        .expect("Failed to receive event")
}

#[tokio::test]
async fn test_scenario_lifecycle_events() {
    let mut dispatcher = Dispatcher::new(MockDriver::new(), DispatcherConfig::default());
    let mut receiver = dispatcher.subscribe();

    // 1. Submit a read and let it finish
    let id = dispatcher.submit(Job::read(0x1000, 4).unwrap(), |r| assert!(r.is_ok()));
    dispatcher.wait(id);

    // 2. Events arrive in lifecycle order
    assert_eq!(next_event(&mut receiver).await, JobEvent::Submitted { id, operation: "read" });
    assert_eq!(next_event(&mut receiver).await, JobEvent::Started { id, operation: "read" });
    match next_event(&mut receiver).await {
        JobEvent::Finished { id: finished, operation, result, .. } => {
            assert_eq!(finished, id);
            assert_eq!(operation, "read");
            assert_eq!(result, ResultCode::Success);
        }
        other => panic!("Expected Finished event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_scenario_erase_progress_events() {
    let mut dispatcher = Dispatcher::new(MockDriver::new(), DispatcherConfig::default());
    let mut receiver = dispatcher.subscribe();

    let response = dispatcher.run(Job::erase(EraseMode::All, 0, 0).unwrap()).unwrap();
    assert!(response.values.is_empty());

    let mut events = Vec::new();
    loop {
        let event = next_event(&mut receiver).await;
        let finished = matches!(event, JobEvent::Finished { .. });
        events.push(event);
        if finished {
            break;
        }
    }
    let updates: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress { update, .. } => Some(update.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec![ProgressUpdate::Erasing, ProgressUpdate::Finished]);
    assert!(matches!(events.last(), Some(JobEvent::Finished { result: ResultCode::Success, .. })));
}

#[tokio::test]
async fn test_scenario_failure_event_carries_result_code() {
    let mut driver = MockDriver::new();
    driver.fail_on("read", probejob_core::LowLevelError::InvalidParameter);
    let mut dispatcher = Dispatcher::new(driver, DispatcherConfig::default());
    let mut receiver = dispatcher.subscribe();

    assert!(dispatcher.run(Job::read(0x1000, 4).unwrap()).is_err());

    let _submitted = next_event(&mut receiver).await;
    let _started = next_event(&mut receiver).await;
    assert!(matches!(
        next_event(&mut receiver).await,
        JobEvent::Finished { result: ResultCode::CouldNotRead, .. }
    ));
}

#[test]
fn test_scenario_rtt_not_started_is_soft() {
    let driver = rtt_driver();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(driver, DispatcherConfig::default());

    let stop = dispatcher.run(Job::rtt_stop()).unwrap();
    assert!(stop.rtt_not_started);
    assert!(stop.values.is_empty());

    let read = dispatcher.run(Job::rtt_read(0, 64).unwrap()).unwrap();
    assert!(read.rtt_not_started);
    assert_eq!(
        read.values,
        vec![OutputValue::Text(String::new()), OutputValue::Bytes(Vec::new()), OutputValue::Micros(0)]
    );

    let write = dispatcher.run(Job::rtt_write(0, b"ping".to_vec()).unwrap()).unwrap();
    assert!(write.rtt_not_started);
    assert_eq!(write.values[0], OutputValue::Count(0));

    // None of them touched the probe.
    assert!(log.records().is_empty());
}

#[test]
fn test_scenario_rtt_start_with_known_address() {
    let driver = rtt_driver();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(driver, DispatcherConfig::default());

    let start = dispatcher.run(Job::rtt_start(Some(CONTROL_BLOCK), RttConnection::default())).unwrap();
    assert_eq!(log.operations(), vec!["rtt_start", "rtt_channels"]);

    let down = start.values[0].as_channels().unwrap();
    let up = start.values[1].as_channels().unwrap();
    assert_eq!(down.len(), 1);
    assert_eq!(down[0].direction, ChannelDirection::Down);
    assert_eq!(up.len(), 2);
    assert_eq!(up[0].name, "Terminal");
    assert_eq!(up[1].size, 256);
}

#[test]
fn test_scenario_rtt_start_scans_for_control_block() {
    let driver = rtt_driver();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(driver, DispatcherConfig::default());

    dispatcher.run(Job::rtt_start(None, RttConnection::default())).unwrap();
    assert_eq!(log.operations(), vec!["rtt_find_control_block", "rtt_start", "rtt_channels"]);
}

#[test]
fn test_scenario_rtt_start_without_control_block() {
    let driver = MockDriver::new();
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(driver, DispatcherConfig::default());

    let err = dispatcher.run(Job::rtt_start(None, RttConnection::default())).unwrap_err();
    assert_eq!(err.result(), ResultCode::RttCouldNotFindControlBlock);
    assert_eq!(err.lowlevel(), None);

    // Channels are only enumerated once a control block was found.
    assert_eq!(log.operations(), vec!["rtt_find_control_block"]);
}

#[test]
fn test_scenario_rtt_channel_failure_stops_session() {
    let mut driver = rtt_driver();
    driver.fail_on("rtt_channels", probejob_core::LowLevelError::InvalidOperation);
    let log = driver.log();
    let mut dispatcher = Dispatcher::new(driver, DispatcherConfig::default());

    let err = dispatcher.run(Job::rtt_start(Some(CONTROL_BLOCK), RttConnection::default())).unwrap_err();
    assert_eq!(err.result(), ResultCode::RttCouldNotGetChannelInformation);
    assert_eq!(log.operations(), vec!["rtt_start", "rtt_channels", "rtt_stop"]);

    assert!(dispatcher.run(Job::rtt_stop()).unwrap().rtt_not_started);
}

#[test]
fn test_scenario_rtt_session() {
    let mut dispatcher = Dispatcher::new(rtt_driver(), DispatcherConfig::default());
    dispatcher.run(Job::rtt_start(None, RttConnection::default())).unwrap();

    dispatcher.mutex().lock().unwrap().push_rtt_up(0, b"hello from target");
    let read = dispatcher.run(Job::rtt_read(0, 5).unwrap()).unwrap();
    assert!(!read.rtt_not_started);
    assert_eq!(read.values[0].as_text(), Some("hello"));
    assert_eq!(read.values[1].as_bytes(), Some(&b"hello"[..]));

    let write = dispatcher.run(Job::rtt_write(0, b"0123456789abcdefXYZ".to_vec()).unwrap()).unwrap();
    assert_eq!(write.values[0], OutputValue::Count(16));
    assert_eq!(dispatcher.mutex().lock().unwrap().rtt_down_data(0), b"0123456789abcdef");

    // A second start replaces the running session.
    let log = dispatcher.mutex().lock().unwrap().log();
    log.clear();
    dispatcher.run(Job::rtt_start(Some(CONTROL_BLOCK), RttConnection::default())).unwrap();
    assert_eq!(log.operations(), vec!["rtt_stop", "rtt_start", "rtt_channels"]);

    assert!(!dispatcher.run(Job::rtt_stop()).unwrap().rtt_not_started);
    assert!(dispatcher.run(Job::rtt_stop()).unwrap().rtt_not_started);
}
