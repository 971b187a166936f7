use karbon_core::event::{CanFrame, Event};
use karbon_core::protocol::{
    ChannelKind, CodecKind, KarbonError, MockChannel, PortClaim, TerminalCommand,
};
use karbon_core::reaction::Matcher;
use karbon_core::session::{Session, SessionConfig, SessionState};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn open_can(name: &str) -> (Session, MockChannel) {
    let mock = MockChannel::new();
    let session = Session::open_channel(name, ChannelKind::Can, mock.clone(), SessionConfig::default())
        .expect("open mock session");
    (session, mock)
}

#[test]
fn test_frames_arrive_in_order() {
    let (session, mock) = open_can("it-order");
    mock.inject(b"100 01\r101 0203\r");
    mock.inject(b"102 040506\r");

    let ids: Vec<u32> = (0..3)
        .map(|_| session.recv(WAIT).unwrap().as_can_frame().unwrap().id)
        .collect();
    assert_eq!(ids, vec![0x100, 0x101, 0x102]);
    assert!(matches!(session.try_recv(), Err(KarbonError::WouldBlock)));
}

#[test]
fn test_frame_split_across_reads() {
    let (session, mock) = open_can("it-split");
    mock.inject(b"7ff 11");
    thread::sleep(Duration::from_millis(30));
    mock.inject(b"2233\r");

    let event = session.recv(WAIT).unwrap();
    assert_eq!(event, Event::CanFrame(CanFrame::new(0x7FF, vec![0x11, 0x22, 0x33]).unwrap()));
}

#[test]
fn test_send_encodes_frames_and_remote_requests() {
    let (session, mock) = open_can("it-send");
    session.send(CanFrame::new(0x123, vec![0x11, 0x22]).unwrap()).unwrap();
    session.send_remote(0x18FF_0001, 4).unwrap();

    let written = String::from_utf8(mock.take_written()).unwrap();
    assert_eq!(written, "std 123 2 1122 data\rext 18ff0001 4 FF remote\r");
}

#[test]
fn test_close_wakes_blocked_recv() {
    let (session, _mock) = open_can("it-close-wakes");
    let session = Arc::new(session);

    let waiter = {
        let session = session.clone();
        thread::spawn(move || {
            let start = Instant::now();
            (session.recv(Duration::from_secs(30)), start.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(50));
    session.close().unwrap();

    let (result, elapsed) = waiter.join().unwrap();
    assert!(matches!(result, Err(KarbonError::NotOpen)));
    assert!(elapsed < Duration::from_secs(5));
}

#[test]
fn test_second_open_is_busy_until_closed() {
    let (first, _mock) = open_can("it-busy");
    let second = Session::open_channel(
        "it-busy",
        ChannelKind::Can,
        MockChannel::new(),
        SessionConfig::default(),
    );
    assert!(matches!(second, Err(KarbonError::PortBusy(name)) if name == "it-busy"));

    first.close().unwrap();
    assert!(Session::open_channel(
        "it-busy",
        ChannelKind::Can,
        MockChannel::new(),
        SessionConfig::default()
    )
    .is_ok());
}

#[test]
fn test_double_close_and_drop() {
    let (session, _mock) = open_can("it-double-close");
    session.close().unwrap();
    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    drop(session);

    let (session, _mock) = open_can("it-double-close");
    drop(session);
    assert!(Session::open_channel(
        "it-double-close",
        ChannelKind::Can,
        MockChannel::new(),
        SessionConfig::default()
    )
    .is_ok());
}

#[test]
fn test_close_times_out_on_busy_callback_and_retries() {
    let mock = MockChannel::new();
    let config = SessionConfig {
        close_timeout_ms: 50,
        ..SessionConfig::default()
    };
    let session = Session::open_channel("it-close-stuck", ChannelKind::Can, mock.clone(), config).unwrap();

    let started = Arc::new(AtomicBool::new(false));
    {
        let started = started.clone();
        session.register(
            Matcher::CanId(0x1),
            move |_| {
                started.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(400));
                Ok(None)
            },
            None,
        );
    }
    mock.inject(b"1 00\r");
    let deadline = Instant::now() + WAIT;
    while !started.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(started.load(Ordering::SeqCst));

    assert!(matches!(
        session.close(),
        Err(KarbonError::ReaderStuck(timeout)) if timeout == Duration::from_millis(50)
    ));
    assert!(PortClaim::is_claimed("it-close-stuck"));

    thread::sleep(Duration::from_millis(500));
    assert!(PortClaim::is_claimed("it-close-stuck"));
    session.close().unwrap();
    assert!(!PortClaim::is_claimed("it-close-stuck"));
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn test_events_queued_before_close_are_still_delivered() {
    let (session, mock) = open_can("it-drain-after-close");
    mock.inject(b"1 aa\r");
    assert!(session.peek(WAIT).is_ok());

    session.close().unwrap();
    assert_eq!(session.recv(WAIT).unwrap().as_can_frame().unwrap().id, 1);
    assert!(matches!(session.recv(WAIT), Err(KarbonError::NotOpen)));
}

#[test]
fn test_read_failure_faults_session() {
    let (session, mock) = open_can("it-fault");
    let reported = Arc::new(Mutex::new(Vec::new()));
    {
        let reported = reported.clone();
        session.set_error_sink(Arc::new(move |e: &KarbonError| {
            reported.lock().unwrap().push(e.to_string());
        }));
    }

    mock.fail_reads(std::io::ErrorKind::BrokenPipe);
    assert!(matches!(session.recv(WAIT), Err(KarbonError::IoError(_))));
    assert_eq!(session.state(), SessionState::Faulted);
    assert_eq!(reported.lock().unwrap().len(), 1);
    assert!(matches!(
        session.send(CanFrame::new(1, vec![]).unwrap()),
        Err(KarbonError::NotOpen)
    ));

    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn test_write_failure_is_io_error() {
    let (session, mock) = open_can("it-write-fail");
    mock.fail_writes(std::io::ErrorKind::BrokenPipe);
    assert!(matches!(
        session.send(CanFrame::new(1, vec![]).unwrap()),
        Err(KarbonError::IoError(_))
    ));
    assert_eq!(session.state(), SessionState::Open);
}

#[test]
fn test_overflow_keeps_latest_events() {
    let mock = MockChannel::new();
    let config = SessionConfig {
        queue_capacity: 3,
        ..SessionConfig::default()
    };
    let session = Session::open_channel("it-overflow", ChannelKind::Can, mock.clone(), config).unwrap();

    let mut burst = Vec::new();
    for id in 1..=10u32 {
        burst.extend_from_slice(format!("{:x} 00\r", id).as_bytes());
    }
    mock.inject(&burst);

    let deadline = Instant::now() + WAIT;
    while session.overflow_count() < 7 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    let ids: Vec<u32> = session
        .drain()
        .iter()
        .filter_map(|e| e.as_can_frame().map(|f| f.id))
        .collect();
    assert_eq!(ids, vec![8, 9, 10]);
    assert_eq!(session.overflow_count(), 7);
}

#[test]
fn test_terminal_commands_and_reports() {
    let mock = MockChannel::new().with_responder(|_, written| match written {
        b"dio-state\r" => Some(b"1000 0000\r".to_vec()),
        b"version\r" => Some(b"<2.1.0 | Feb 11 2022>\r".to_vec()),
        _ => None,
    });
    let terminal =
        Session::open_channel("it-terminal", ChannelKind::Terminal, mock.clone(), SessionConfig::default())
            .unwrap();

    terminal.send(TerminalCommand::DioState).unwrap();
    let dio = terminal.recv(WAIT).unwrap().as_dio().unwrap();
    assert!(dio.input(0));

    terminal.send(TerminalCommand::Version).unwrap();
    assert_eq!(
        terminal.recv(WAIT).unwrap(),
        Event::ConfigEntry {
            key: "version".into(),
            value: "2.1.0".into()
        }
    );
    assert_eq!(terminal.recv(WAIT).unwrap(), Event::ConfigEntry {
        key: "build".into(),
        value: "Feb 11 2022".into()
    });

    terminal.send(TerminalCommand::set_output(2, true)).unwrap();
    assert!(String::from_utf8(mock.written()).unwrap().ends_with("set-do --1-\r"));
}

#[test]
fn test_binary_codec_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "codec": "binary_can", "queue_capacity": 8 }}"#).unwrap();
    let config = SessionConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.codec, CodecKind::BinaryCan);

    let mock = MockChannel::new();
    let session = Session::open_channel("it-binary", ChannelKind::Can, mock.clone(), config).unwrap();
    let frame = CanFrame::new(0x42, vec![1, 2, 3]).unwrap();
    session.send(frame.clone()).unwrap();

    // Loop the written bytes back as received traffic
    mock.inject(&mock.take_written());
    assert_eq!(session.recv(WAIT).unwrap(), Event::CanFrame(frame));
}

#[test]
fn test_scoped_requires_real_port() {
    let port = karbon_core::protocol::PortRef::new("/dev/karbon-does-not-exist", ChannelKind::Can);
    let result = Session::scoped(&port, SessionConfig::default(), |_| Ok(()));
    assert!(result.is_err());
    assert!(!karbon_core::protocol::PortClaim::is_claimed("/dev/karbon-does-not-exist"));
}
