//! Collaborator tests: signal decoding, DTC matching, candump parsing, replay and simulated
//! sources, sinks, config file handling.

use canflow::engine::arg_parser::parse_can_id;
use canflow::engine::diagnostics::candidate_codes;
use canflow::engine::hardware::LoggedFrame;
use canflow::engine::sinks::{format_clock, format_record};
use canflow::engine::{
    ChannelSink, Decoder, DtcTable, Hardware, JsonLinesSink, ReplayBus, SignalDatabase,
    SimulatedBus, Sink, find_diagnostics, parse_candump_line,
};
use canflow::pipeline::BoundedChannel;
use canflow::utils::canflow_toml::{
    apply_file_to_opts, load_default_canflow_toml, parse_canflow_toml, secs_to_duration,
};
use canflow::{
    DecodedMessage, Direction, DtcInfo, Opts, ProcessedRecord, RawFrame, SignalValue,
};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

const ENGINE_DB: &str = r#"
[[message]]
id = 0x100
name = "EngineData"
length = 8

[[message.signal]]
name = "Rpm"
start = 0
length = 16
factor = 0.25

[[message.signal]]
name = "Gear"
start = 16
length = 4
values = { "0" = "Park", "1" = "Reverse" }

[[message.signal]]
name = "Torque"
start = 24
length = 8
signed = true

[[message.signal]]
name = "Coolant"
start = 32
length = 8
offset = -40.0

[[message]]
id = 0x200
name = "Speed"
length = 2

[[message.signal]]
name = "Speed"
start = 7
length = 16
byte_order = "big_endian"
"#;

fn record(id: u32, payload: &[u8], seq: u64) -> ProcessedRecord {
    ProcessedRecord {
        frame: RawFrame::new(id, payload, Direction::Received),
        decoded: None,
        diagnostics: Vec::new(),
        seq,
        processed_ns: 0,
    }
}

fn dtc(name: &str) -> DtcInfo {
    DtcInfo {
        name: name.to_string(),
        description: String::new(),
        severity: "high".to_string(),
    }
}

// --- SignalDatabase ---

#[test]
fn test_decode_little_endian_signals() {
    let db = SignalDatabase::from_toml_str(ENGINE_DB).unwrap();
    assert_eq!(db.len(), 2);
    let msg = db
        .decode(0x100, &[0x10, 0x27, 0x01, 0xF6, 0x64, 0, 0, 0])
        .unwrap();
    assert_eq!(msg.name, "EngineData");
    assert_eq!(msg.signals["Rpm"], SignalValue::Number(2500.0));
    assert_eq!(msg.signals["Gear"], SignalValue::Enum("Reverse".to_string()));
    assert_eq!(msg.signals["Torque"], SignalValue::Number(-10.0));
    assert_eq!(msg.signals["Coolant"], SignalValue::Number(60.0));
}

#[test]
fn test_decode_big_endian_signal() {
    let db = SignalDatabase::from_toml_str(ENGINE_DB).unwrap();
    let msg = db.decode(0x200, &[0x12, 0x34]).unwrap();
    assert_eq!(msg.signals["Speed"], SignalValue::Number(4660.0));
}

#[test]
fn test_decode_unknown_id_or_wrong_length_is_none() {
    let db = SignalDatabase::from_toml_str(ENGINE_DB).unwrap();
    assert!(db.decode(0x321, &[0; 8]).is_none());
    assert!(db.decode(0x100, &[1, 2, 3]).is_none());
    assert!(db.decode(0x200, &[]).is_none());
}

#[test]
fn test_signal_database_rejects_bad_definitions() {
    let past_end = r#"
[[message]]
id = 0x10
name = "Short"
length = 1

[[message.signal]]
name = "Wide"
start = 4
length = 8
"#;
    assert!(SignalDatabase::from_toml_str(past_end).is_err());

    let zero_len = r#"
[[message]]
id = 0x10
name = "Empty"
length = 1

[[message.signal]]
name = "Nothing"
start = 0
length = 0
"#;
    assert!(SignalDatabase::from_toml_str(zero_len).is_err());

    let duplicate = r#"
[[message]]
id = 0x10
name = "A"
length = 1

[[message]]
id = 0x10
name = "B"
length = 1
"#;
    assert!(SignalDatabase::from_toml_str(duplicate).is_err());
}

#[test]
fn test_signal_database_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("signals.toml");
    std::fs::write(&path, ENGINE_DB).unwrap();
    let db = SignalDatabase::load(&path).unwrap();
    assert!(db.message(0x100).is_some());
    assert!(SignalDatabase::load(&dir.path().join("missing.toml")).is_err());
}

// --- Diagnostics ---

#[test]
fn test_candidate_codes_distinct_in_order() {
    assert_eq!(
        candidate_codes("fault p0301 and U0100, P0301"),
        vec!["P0301".to_string(), "U0100".to_string()]
    );
    assert!(candidate_codes("P4301 X0301 P03").is_empty());
}

#[test]
fn test_find_diagnostics_in_decoded_signals() {
    let table = DtcTable::from_entries([("p0301".to_string(), dtc("Cylinder 1 Misfire"))]);
    let mut signals = BTreeMap::new();
    signals.insert("Code".to_string(), SignalValue::Enum("p0301".to_string()));
    signals.insert("Other".to_string(), SignalValue::Enum("U0100".to_string()));
    signals.insert("Rpm".to_string(), SignalValue::Number(1.0));
    let decoded = DecodedMessage {
        name: "Dtc".to_string(),
        signals,
    };
    let hits = find_diagnostics(&table, Some(&decoded), "");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].code, "P0301");
    assert_eq!(hits[0].info.name, "Cylinder 1 Misfire");
    assert_eq!(hits[0].source_signal.as_deref(), Some("Code"));
}

#[test]
fn test_find_diagnostics_in_payload_hex() {
    let table = DtcTable::from_entries([("C0123".to_string(), dtc("Wheel speed"))]);
    let frame = RawFrame::new(0x7E8, &[0xC0, 0x12, 0x3A], Direction::Received);
    let hits = find_diagnostics(&table, None, &frame.payload_hex());
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].code, "C0123");
    assert_eq!(hits[0].source_signal, None);

    let empty = DtcTable::default();
    assert!(find_diagnostics(&empty, None, &frame.payload_hex()).is_empty());
}

#[test]
fn test_dtc_table_load_toml_and_json() {
    let dir = tempfile::tempdir().unwrap();
    let toml_path = dir.path().join("dtc.toml");
    std::fs::write(
        &toml_path,
        "[P0301]\nname = \"Cylinder 1 Misfire\"\ndescription = \"Misfire detected\"\nseverity = \"high\"\n",
    )
    .unwrap();
    let table = DtcTable::load(&toml_path).unwrap();
    assert_eq!(table.len(), 1);

    let json_path = dir.path().join("dtc.json");
    std::fs::write(&json_path, r#"{"p0420": {"name": "Catalyst efficiency"}}"#).unwrap();
    let table = DtcTable::load(&json_path).unwrap();
    let hits = find_diagnostics(&table, None, "P0420");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].info.description, "");
}

// --- candump parsing / ReplayBus ---

#[test]
fn test_parse_candump_standard_and_extended() {
    let f = parse_candump_line("(1436509052.249713) can0 0F0#0102").unwrap();
    assert_eq!(f.id, 0xF0);
    assert!(!f.extended);
    assert_eq!(f.payload, vec![1, 2]);
    assert_eq!(f.interface, "can0");
    assert!((f.time_s - 1436509052.249713).abs() < 1e-6);

    let f = parse_candump_line("(1.0) vcan1 1F334455#DEADBEEF").unwrap();
    assert!(f.extended);
    assert_eq!(f.id, 0x1F33_4455);
    assert_eq!(f.payload, vec![0xDE, 0xAD, 0xBE, 0xEF]);

    let f = parse_candump_line("(1.0) can0 123#R").unwrap();
    assert!(f.payload.is_empty());
}

#[test]
fn test_parse_candump_rejects_malformed() {
    for line in [
        "(1.0) can0 123##1AA",
        "(1.0) can0 123#0",
        "can0 123#00",
        "(1.0) can0 800#00",
        "(1.0) can0 123#000102030405060708",
        "(x) can0 123#00",
        "(1.0) can0 123",
    ] {
        assert!(parse_candump_line(line).is_err(), "accepted: {line}");
    }
}

fn logged(id: u32, iface: &str, payload: &[u8]) -> LoggedFrame {
    LoggedFrame {
        time_s: 0.0,
        interface: iface.to_string(),
        id,
        extended: id > 0x7FF,
        payload: payload.to_vec(),
    }
}

#[test]
fn test_replay_bus_delivers_in_order_then_exhausts() {
    let mut bus = ReplayBus::from_frames(
        vec![logged(0x100, "can0", &[1]), logged(0x200, "vcan1", &[2])],
        false,
        "test".to_string(),
    );
    assert!(bus.is_connected());
    let a = bus.poll(Duration::from_millis(1)).unwrap().unwrap();
    let b = bus.poll(Duration::from_millis(1)).unwrap().unwrap();
    assert_eq!((a.id, a.channel), (0x100, 0));
    assert_eq!((b.id, b.channel), (0x200, 1));
    assert!(bus.is_exhausted());
    assert!(bus.poll(Duration::from_millis(1)).unwrap().is_none());
    assert!(bus.send(0x1, &[]).is_err());
    bus.close().unwrap();
    assert!(!bus.is_connected());
    assert!(bus.poll(Duration::from_millis(1)).is_err());
}

#[test]
fn test_replay_bus_open_skips_bad_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.log");
    std::fs::write(
        &path,
        "# header\n(1.0) can0 100#01\n\ngarbage\n(1.1) can0 7DF#0201\n",
    )
    .unwrap();
    let bus = ReplayBus::open(&path, false).unwrap();
    assert_eq!(bus.remaining(), 2);
}

// --- SimulatedBus ---

#[test]
fn test_simulated_bus_emits_reference_frame() {
    let mut bus = SimulatedBus::new(Duration::from_millis(1));
    let f = bus.poll(Duration::from_millis(100)).unwrap().unwrap();
    assert_eq!(f.id, SimulatedBus::DEFAULT_ID);
    assert_eq!(f.payload, SimulatedBus::DEFAULT_PAYLOAD.to_vec());
    assert!(f.direction.is_rx());
}

#[test]
fn test_simulated_bus_echoes_sent_frames() {
    let mut bus = SimulatedBus::with_rate(0);
    assert!(bus.poll(Duration::from_millis(1)).unwrap().is_none());
    bus.send(0x123, &[0xAA, 0xBB]).unwrap();
    let f = bus.poll(Duration::from_millis(1)).unwrap().unwrap();
    assert_eq!(f.id, 0x123);
    assert_eq!(f.direction, Direction::Transmitted);
    assert!(bus.send(0x123, &[0; 9]).is_err());
    bus.close().unwrap();
    assert!(!bus.is_connected());
    assert!(bus.poll(Duration::from_millis(1)).is_err());
}

// --- Sinks ---

#[test]
fn test_format_clock() {
    assert_eq!(format_clock(0), "00:00:00.000");
    assert_eq!(format_clock(3_723_456_000_000), "01:02:03.456");
}

#[test]
fn test_format_record_line() {
    let mut r = record(0x100, &[1, 2, 3], 1);
    r.frame.timestamp_ns = 3_723_456_000_000;
    assert_eq!(format_record(&r), "01:02:03.456 RX 0x100 [3] 01 02 03");
    r.decoded = Some(DecodedMessage {
        name: "EngineData".to_string(),
        signals: BTreeMap::new(),
    });
    assert_eq!(
        format_record(&r),
        "01:02:03.456 RX 0x100 [3] 01 02 03 - EngineData"
    );
}

#[test]
fn test_json_lines_sink_appends_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.jsonl");
    let mut sink = JsonLinesSink::create(&path).unwrap();
    sink.on_record(&record(0x100, &[1, 2], 1)).unwrap();
    sink.on_record(&record(0x200, &[], 2)).unwrap();
    sink.finish().unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["id"], 256);
    assert_eq!(lines[0]["data"], "0102");
    assert_eq!(lines[0]["direction"], "RX");
    assert!(lines[0].get("name").is_none());
    assert!(lines[0].get("dtcs").is_none());
    assert_eq!(lines[1]["seq"], 2);
}

#[test]
fn test_channel_sink_drops_when_full() {
    let (tx, rx) = BoundedChannel::new::<ProcessedRecord>("observer", 1);
    let mut sink = ChannelSink::new(tx);
    let dropped = sink.dropped();
    sink.on_record(&record(0x1, &[], 1)).unwrap();
    sink.on_record(&record(0x2, &[], 2)).unwrap();
    assert_eq!(dropped.load(Ordering::Relaxed), 1);
    assert_eq!(rx.try_pop(Duration::ZERO).unwrap().seq, 1);
    assert_eq!(sink.name(), "observer");
}

// --- Config file / CLI ids ---

#[test]
fn test_parse_can_id() {
    assert_eq!(parse_can_id("0x100"), Ok(0x100));
    assert_eq!(parse_can_id("7df"), Ok(0x7DF));
    assert_eq!(parse_can_id("18DAF110"), Ok(0x18DA_F110));
    assert!(parse_can_id("zz").is_err());
    assert!(parse_can_id("20000000").is_err());
}

#[test]
fn test_canflow_toml_applies_present_fields() {
    let file = parse_canflow_toml(
        r#"
[capture]
max_rate = 500
id_filter = ["100", "0x7DF"]

[storage]
batch_size = 200
cooldown_secs = 5.0

[health]
status_interval_ms = 250
verbose = true
"#,
    )
    .unwrap();
    let mut opts = Opts::default();
    let before = opts.clone();
    apply_file_to_opts(&file, &mut opts).unwrap();
    assert_eq!(opts.max_rate, 500);
    assert_eq!(opts.id_filter, vec![0x100, 0x7DF]);
    assert_eq!(opts.batch_size, 200);
    assert_eq!(opts.storage_cooldown, Duration::from_secs(5));
    assert_eq!(opts.status_interval, Duration::from_millis(250));
    assert!(opts.verbose);
    assert_eq!(opts.channel_capacity, before.channel_capacity);
    assert_eq!(opts.min_interval(), Duration::from_millis(2));
}

#[test]
fn test_canflow_toml_rejects_unknown_keys_and_bad_ids() {
    assert!(parse_canflow_toml("[capture]\nmax_rat = 5\n").is_err());
    assert!(parse_canflow_toml("[metrics]\nenabled = true\n").is_err());

    let file = parse_canflow_toml("[capture]\nid_filter = [\"nope\"]\n").unwrap();
    let mut opts = Opts::default();
    assert!(apply_file_to_opts(&file, &mut opts).is_err());

    for text in [
        "[storage]\ncooldown_secs = 1e30\n",
        "[capture]\ncooldown_secs = inf\n",
        "[health]\nrate_window_secs = 1e20\n",
    ] {
        let file = parse_canflow_toml(text).unwrap();
        let err = apply_file_to_opts(&file, &mut Opts::default()).unwrap_err();
        assert!(format!("{err:#}").contains("secs"), "{err:#}");
    }
}

#[test]
fn test_secs_to_duration_clamps_and_rejects() {
    assert_eq!(secs_to_duration(1.5).unwrap(), Duration::from_millis(1500));
    assert_eq!(secs_to_duration(-3.0).unwrap(), Duration::ZERO);
    assert!(secs_to_duration(f64::INFINITY).is_err());
    assert!(secs_to_duration(1e30).is_err());
}

#[test]
fn test_default_canflow_toml_lookup() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_default_canflow_toml(dir.path()).unwrap().is_none());

    std::fs::write(dir.path().join(".canflow.toml"), "[storage]\nbatch_size = 7\n").unwrap();
    let file = load_default_canflow_toml(dir.path()).unwrap().unwrap();
    let mut opts = Opts::default();
    apply_file_to_opts(&file, &mut opts).unwrap();
    assert_eq!(opts.batch_size, 7);

    std::fs::write(dir.path().join(".canflow.toml"), "not toml [").unwrap();
    assert!(load_default_canflow_toml(dir.path()).is_err());
}
