//! End-to-end poll cycle tests against an in-memory fake device.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serpoll::prelude::*;
use serpoll::protocols::modbus::{self, ModbusProtocolInfo};

/// Shared state of the fake device, visible to both the driver and the test.
struct FakeState {
    registers: Mutex<Vec<u16>>,
    connected: AtomicBool,
    read_blocked: Mutex<HashSet<u32>>,
    executed: Mutex<Vec<(Operation, u32, u32)>>,
}

impl FakeState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            registers: Mutex::new(vec![0; 4096]),
            connected: AtomicBool::new(true),
            read_blocked: Mutex::new(HashSet::new()),
            executed: Mutex::new(Vec::new()),
        })
    }

    fn set_register(&self, address: u32, value: u16) {
        self.registers.lock().unwrap()[address as usize] = value;
    }

    fn register(&self, address: u32) -> u16 {
        self.registers.lock().unwrap()[address as usize]
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn block_read(&self, address: u32) {
        self.read_blocked.lock().unwrap().insert(address);
    }

    fn executed(&self) -> Vec<(Operation, u32, u32)> {
        self.executed.lock().unwrap().clone()
    }

    fn clear_log(&self) {
        self.executed.lock().unwrap().clear();
    }
}

/// Driver backed by a plain register array, in the spirit of a fake serial
/// port: supports disconnect simulation and per-address read blocking.
struct FakeDriver {
    state: Arc<FakeState>,
}

impl DeviceDriver for FakeDriver {
    fn execute(&mut self, query: &Query) {
        self.state
            .executed
            .lock()
            .unwrap()
            .push((query.operation(), query.start(), query.count()));

        if !self.state.connected.load(Ordering::SeqCst) {
            query.set_status(QueryStatus::DeviceDisconnected);
            return;
        }

        match query.operation() {
            Operation::Read => {
                let blocked = self.state.read_blocked.lock().unwrap();
                if query.blocks().iter().any(|b| blocked.contains(&b.address())) {
                    query.set_status(QueryStatus::DevicePermanentError);
                    return;
                }
                drop(blocked);

                // the wire transports the whole span, holes included
                let registers = self.state.registers.lock().unwrap();
                let mut range = Vec::with_capacity(query.count() as usize * 2);
                for address in query.start()..query.start() + query.count() {
                    range.extend(registers[address as usize].to_be_bytes());
                }
                drop(registers);

                let bytes = query.compact_range_bytes(&range).unwrap();
                query.finalize_read(&bytes).unwrap();
            }
            Operation::Write => {
                let bytes = query.pending_bytes();
                let mut registers = self.state.registers.lock().unwrap();
                let mut offset = 0;
                for block in query.blocks() {
                    let value = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
                    registers[block.address() as usize] = value;
                    offset += usize::from(block.size());
                }
                drop(registers);

                query.finalize_write();
            }
        }
    }
}

fn fake_device(settings: DeviceSettings) -> (Arc<Device>, Arc<FakeState>) {
    let state = FakeState::new();
    let device = Device::new(
        "fake",
        settings,
        Arc::new(ModbusProtocolInfo),
        Box::new(FakeDriver {
            state: state.clone(),
        }),
    );
    (device, state)
}

fn holding(name: &str, address: u32) -> ChannelSettings {
    ChannelSettings::new(name, modbus::reg::HOLDING, address)
}

fn run_read_cycles(device: &Arc<Device>) -> bool {
    let sets = QueryFactory::plan_query_sets(&device.channels(), Operation::Read).unwrap();
    let mut ok = true;
    for set in &sets {
        ok &= device.run_poll_cycle(set);
    }
    ok
}

// ========== scenario 1: bulk read merge ==========

#[test]
fn bulk_read_merge_respects_hole_and_span_limits() {
    let (device, state) = fake_device(DeviceSettings {
        max_reg_hole: 2,
        max_read_registers: 10,
        ..DeviceSettings::default()
    });

    for (name, address) in [("a", 100), ("b", 101), ("c", 104), ("d", 110)] {
        device.add_channel(&holding(name, address)).unwrap();
    }

    let sets = QueryFactory::plan_query_sets(&device.channels(), Operation::Read).unwrap();
    assert_eq!(sets.len(), 1);

    let queries = sets[0].queries();
    assert_eq!(queries.len(), 2);
    assert_eq!((queries[0].start(), queries[0].count()), (100, 5));
    assert_eq!((queries[1].start(), queries[1].count()), (110, 1));

    state.set_register(100, 11);
    state.set_register(104, 44);
    state.set_register(110, 55);

    assert!(device.run_poll_cycle(&sets[0]));
    assert_eq!(state.executed(), vec![(Operation::Read, 100, 5), (Operation::Read, 110, 1)]);

    let channels = device.channels();
    assert_eq!(channels[0].current_raw(), 11);
    assert_eq!(channels[2].current_raw(), 44);
    assert_eq!(channels[3].current_raw(), 55);
}

// ========== scenario 2: partial-block write through the cache ==========

#[test]
fn partial_block_write_reads_through_cache() {
    let (device, state) = fake_device(DeviceSettings::default());

    // channel A: bits [0..8) (high byte), channel B: bits [8..16)
    let a = device
        .add_channel(
            &holding("a", 50)
                .with_format(RegisterFormat::U8)
                .with_bits(0, 8),
        )
        .unwrap();
    device
        .add_channel(
            &holding("b", 50)
                .with_format(RegisterFormat::U8)
                .with_bits(8, 8),
        )
        .unwrap();

    let block = device.ensure_block(modbus::reg::HOLDING, 50, None).unwrap();
    assert!(block.needs_caching());
    device.allocate_caches();

    // a poll fills the cache with the device's current state
    state.set_register(50, 0x00A3);
    assert!(run_read_cycles(&device));
    assert_eq!(block.cached_bytes(), vec![0x00, 0xA3]);

    // writing A must keep B's byte intact
    a.set_text_value("90").unwrap(); // 0x5A
    a.flush().unwrap();

    assert_eq!(state.register(50), 0x5AA3);
    assert_eq!(block.cached_bytes(), vec![0x5A, 0xA3]);
}

// ========== scenario 3: word order ==========

#[test]
fn little_endian_word_order_reverses_registers() {
    let (device, state) = fake_device(DeviceSettings::default());

    let value = device
        .add_channel(
            &holding("value", 200)
                .with_format(RegisterFormat::U32)
                .with_word_order(WordOrder::LittleEndian),
        )
        .unwrap();

    state.set_register(200, 0xAABB);
    state.set_register(201, 0xCCDD);

    assert!(run_read_cycles(&device));
    assert_eq!(value.current_raw(), 0xCCDDAABB);

    // and back out: writing travels through the same swap
    value.set_text_value(&0xCCDDAABBu32.to_string()).unwrap();
    value.flush().unwrap();
    assert_eq!(state.register(200), 0xAABB);
    assert_eq!(state.register(201), 0xCCDD);
}

// ========== scenario 4: BCD ==========

#[test]
fn bcd_decode_and_encode() {
    let (device, state) = fake_device(DeviceSettings::default());

    let counter = device
        .add_channel(&holding("counter", 60).with_format(RegisterFormat::Bcd16))
        .unwrap();

    state.set_register(60, 0x1234);
    assert!(run_read_cycles(&device));
    assert_eq!(counter.get_text_value(), "1234");

    counter.set_text_value("4321").unwrap();
    counter.flush().unwrap();
    assert_eq!(state.register(60), 0x4321);
}

// ========== scenario 5: error value ==========

#[test]
fn error_value_raises_read_error_and_preserves_value() {
    let (device, state) = fake_device(DeviceSettings::default());

    let sensor = device
        .add_channel(&holding("sensor", 70).with_error_value(0xFFFF))
        .unwrap();

    state.set_register(70, 42);
    assert!(run_read_cycles(&device));
    assert_eq!(sensor.current_raw(), 42);
    sensor.reset_changed(PublishKind::Value);
    sensor.reset_changed(PublishKind::Error);

    state.set_register(70, 0xFFFF);
    assert!(run_read_cycles(&device));

    assert!(sensor.error_state().has_read_error());
    assert!(sensor.changed(PublishKind::Error));
    assert!(!sensor.changed(PublishKind::Value));
    assert_eq!(sensor.current_raw(), 42);
}

// ========== scenario 6: disconnect propagation ==========

#[test]
fn disconnect_short_circuits_cycle_and_marks_channels() {
    let (device, state) = fake_device(DeviceSettings {
        device_max_fail_cycles: 2,
        ..DeviceSettings::default()
    });

    // two separate queries (gap of 3, holes disabled)
    let near = device.add_channel(&holding("near", 1)).unwrap();
    let far = device.add_channel(&holding("far", 5)).unwrap();

    let sets = QueryFactory::plan_query_sets(&device.channels(), Operation::Read).unwrap();
    assert_eq!(sets[0].queries().len(), 2);

    state.set_connected(false);
    state.clear_log();

    assert!(!device.run_poll_cycle(&sets[0]));
    // the second query was skipped
    assert_eq!(state.executed().len(), 1);
    assert_eq!(device.fail_cycles(), 1);
    assert!(!device.is_disconnected());
    assert!(near.error_state().has_read_error());

    assert!(!device.run_poll_cycle(&sets[0]));
    assert_eq!(device.fail_cycles(), 2);
    assert!(device.is_disconnected());
    assert!(far.error_state().has_read_error());

    // reconnection re-enables polling at the next cycle
    state.set_connected(true);
    state.set_register(1, 7);
    state.set_register(5, 9);

    assert!(device.run_poll_cycle(&sets[0]));
    assert!(!device.is_disconnected());
    assert_eq!(device.fail_cycles(), 0);
    assert_eq!(near.current_raw(), 7);
    assert_eq!(far.current_raw(), 9);
    assert!(!near.error_state().has_read_error());
}

// ========== further end-to-end coverage ==========

#[test]
fn repeated_cycles_accept_once_each() {
    let (device, state) = fake_device(DeviceSettings::default());
    let temp = device.add_channel(&holding("temp", 10)).unwrap();

    state.set_register(10, 1);
    for round in 1..=3u16 {
        state.set_register(10, round);
        assert!(run_read_cycles(&device));
        assert_eq!(temp.current_raw(), u64::from(round));
    }
}

#[test]
fn permanent_error_marks_channel_but_polling_continues() {
    let (device, state) = fake_device(DeviceSettings::default());

    let bad = device.add_channel(&holding("bad", 20)).unwrap();
    let good = device.add_channel(&holding("good", 30)).unwrap();

    state.block_read(20);
    state.set_register(30, 3);

    let ok = run_read_cycles(&device);
    assert!(!ok);

    assert!(bad.error_state().has_read_error());
    assert!(!good.error_state().has_read_error());
    assert_eq!(good.current_raw(), 3);

    // one failed cycle is below the default disconnect threshold
    assert!(!device.is_disconnected());
}

#[test]
fn switch_channel_with_on_value() {
    let (device, state) = fake_device(DeviceSettings::default());

    let mut settings = holding("relay", 80);
    settings.on_value = Some(0xFF00);
    let relay = device.add_channel(&settings).unwrap();

    state.set_register(80, 0xFF00);
    assert!(run_read_cycles(&device));
    assert_eq!(relay.get_text_value(), "1");

    relay.set_text_value("0").unwrap();
    relay.flush().unwrap();
    assert_eq!(state.register(80), 0);
    assert_eq!(relay.get_text_value(), "0");

    relay.set_text_value("1").unwrap();
    relay.flush().unwrap();
    assert_eq!(state.register(80), 0xFF00);
}

#[test]
fn dirty_channel_skips_polling_until_flushed() {
    let (device, state) = fake_device(DeviceSettings::default());
    let setpoint = device.add_channel(&holding("setpoint", 90)).unwrap();

    let signal = Arc::new(FlushSignal::new());
    setpoint.set_flush_signal(signal.clone());

    state.set_register(90, 5);
    assert!(run_read_cycles(&device));
    assert_eq!(setpoint.current_raw(), 5);

    // a staged write shields the channel from poll results
    setpoint.set_text_value("123").unwrap();
    assert!(signal.try_take());
    assert!(!setpoint.needs_poll());

    state.set_register(90, 6);
    assert!(run_read_cycles(&device));
    assert_eq!(setpoint.current_raw(), 5);

    setpoint.flush().unwrap();
    assert_eq!(state.register(90), 123);
    assert_eq!(setpoint.current_raw(), 123);

    // polling resumes after the flush
    state.set_register(90, 7);
    assert!(run_read_cycles(&device));
    assert_eq!(setpoint.current_raw(), 7);
}

#[test]
fn write_while_disconnected_sets_write_error() {
    let (device, state) = fake_device(DeviceSettings::default());
    let setpoint = device.add_channel(&holding("setpoint", 40)).unwrap();

    state.set_connected(false);
    setpoint.set_text_value("9").unwrap();
    setpoint.flush().unwrap();

    assert!(setpoint.error_state().has_write_error());
    assert!(setpoint.changed(PublishKind::Error));
    assert_eq!(setpoint.current_raw(), 0);

    // reconnect, flush again: the error clears
    state.set_connected(true);
    setpoint.set_text_value("9").unwrap();
    setpoint.flush().unwrap();
    assert!(!setpoint.error_state().has_write_error());
    assert_eq!(state.register(40), 9);
}

#[test]
fn wide_channel_spanning_four_registers() {
    let (device, state) = fake_device(DeviceSettings::default());

    let energy = device
        .add_channel(&holding("energy", 300).with_format(RegisterFormat::U64))
        .unwrap();

    state.set_register(300, 0x0011);
    state.set_register(301, 0x2233);
    state.set_register(302, 0x4455);
    state.set_register(303, 0x6677);

    assert!(run_read_cycles(&device));
    assert_eq!(energy.current_raw(), 0x0011_2233_4455_6677);

    energy.set_text_value("1").unwrap();
    energy.flush().unwrap();
    assert_eq!(state.register(300), 0);
    assert_eq!(state.register(303), 1);
}
