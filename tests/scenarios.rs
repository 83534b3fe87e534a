//! End-to-end scenarios exercising the full round / exchange /
//! scheduling pipeline, with small coordination routines (gossip,
//! single-path collection) built on top of the engine the way a
//! coordination library would.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use fieldcast::{
    program_fn, read_arcs, Aggregator, Device, DeviceId, Field, FieldcastResult, FullConnect,
    GraphConnect, GraphSpawner, LogSink, Net, Program, RoundVm, SimTime, StorageRecord,
};

fn uid(n: u32) -> DeviceId {
    DeviceId::new(n)
}

// ── Coordination routines (callers of the engine) ────────────────────

/// Gossip a value through the neighbourhood with an accumulator.
fn gossip(
    vm: &mut RoundVm<'_>,
    tag: u32,
    value: f64,
    accumulate: impl Fn(f64, f64) -> f64 + Copy,
) -> FieldcastResult<f64> {
    vm.aligned(tag, |vm| {
        vm.nbr(0, value, |_, f: &Field<f64>| {
            Ok(f.fold(value, |a, v| accumulate(a, *v)))
        })
    })
}

fn gossip_min(vm: &mut RoundVm<'_>, tag: u32, value: f64) -> FieldcastResult<f64> {
    gossip(vm, tag, value, f64::min)
}

/// Single-path collection: route values along unique parents chosen
/// by minimum `(distance, uid)` and accumulate towards the sink.
fn sp_collection(
    vm: &mut RoundVm<'_>,
    tag: u32,
    distance: f64,
    value: f64,
    null: f64,
    accumulate: impl Fn(f64, f64) -> f64 + Copy,
) -> FieldcastResult<f64> {
    vm.aligned(tag, |vm| {
        vm.nbr(0, null, |vm, collected: &Field<f64>| {
            let me = vm.uid();
            let nbr_dist = vm.nbr_field(1, distance)?;
            let nbr_uid = vm.nbr_field(2, me)?;
            let candidates = nbr_dist.combine(&nbr_uid, |d, u| (*d, u.raw()));
            let parent = DeviceId::new(candidates.min_hood().1);
            let nbr_parent = vm.nbr_field(3, parent)?;
            let contrib =
                nbr_parent.combine(collected, |p, v| if *p == me { *v } else { null });
            Ok(contrib
                .neighbours()
                .fold(value, |acc, (_, v)| accumulate(acc, *v)))
        })
    })
}

// ── Shared test plumbing ─────────────────────────────────────────────

/// A writer appending into a shared buffer, so the log text can be
/// inspected after the net is dropped.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().clone()).unwrap()
    }

    /// Data rows only: the timestamped preamble and footer lines
    /// differ between runs and are skipped.
    fn data_rows(&self) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|l| !l.starts_with('#') && !l.is_empty())
            .map(|l| l.to_string())
            .collect()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ── Scenario 1: gossip-min over three devices ────────────────────────

#[test]
fn gossip_min_three_devices_converges_after_two_rounds() {
    let program = program_fn(|vm: &mut RoundVm<'_>, storage: &mut f64| {
        *storage = gossip_min(vm, 1, *storage)?;
        Ok(())
    });
    let mut net = Net::builder(program, FullConnect)
        .seed(1)
        .retain_window(5.0)
        .round(0.0, 1.0)
        .build()
        .unwrap();
    net.node_emplace_at(uid(1), 5.0).unwrap();
    net.node_emplace_at(uid(2), 2.0).unwrap();
    net.node_emplace_at(uid(3), 9.0).unwrap();

    net.run_until(SimTime::new(1.0)).unwrap();

    for n in [1, 2, 3] {
        assert_eq!(*net.node_at(uid(n)).unwrap().storage(), 2.0, "device {n}");
    }
}

// ── Scenario 2: single-path collection over a chain ──────────────────

#[derive(Clone)]
struct CollectStorage {
    distance: f64,
    value: f64,
    collected: f64,
}

impl StorageRecord for CollectStorage {
    fn tags() -> &'static [&'static str] {
        &["distance", "value", "collected"]
    }

    fn values(&self) -> Vec<f64> {
        vec![self.distance, self.value, self.collected]
    }
}

#[test]
fn sp_collection_chain_sums_at_sink() {
    let program = program_fn(|vm: &mut RoundVm<'_>, storage: &mut CollectStorage| {
        storage.collected = sp_collection(
            vm,
            1,
            storage.distance,
            storage.value,
            0.0,
            |a, b| a + b,
        )?;
        Ok(())
    });

    // Arcs 0↔1, 1↔2, fed through the graph-input path.
    let arcs = read_arcs(std::io::Cursor::new("0 1\n1 0\n1 2\n2 1\n")).unwrap();
    let mut net = Net::builder(program, GraphConnect::from_arcs(arcs))
        .seed(7)
        .retain_window(10.0)
        .round(0.0, 1.0)
        .build()
        .unwrap();

    for (n, distance, value) in [(0, 0.0, 0.0), (1, 1.0, 3.0), (2, 2.0, 4.0)] {
        net.node_emplace_at(
            uid(n),
            CollectStorage {
                distance,
                value,
                collected: 0.0,
            },
        )
        .unwrap();
    }

    net.run_until(SimTime::new(5.0)).unwrap();

    let sink = net.node_at(uid(0)).unwrap();
    assert_eq!(sink.storage().collected, 7.0);
    drop(sink);

    // Stays stable one round later.
    net.run_until(SimTime::new(6.0)).unwrap();
    assert_eq!(net.node_at(uid(0)).unwrap().storage().collected, 7.0);
}

// ── Scenario 3: branch alignment by uid parity ───────────────────────

fn parity_program() -> impl Program<Storage = f64> {
    program_fn(|vm: &mut RoundVm<'_>, storage: &mut f64| {
        let even = vm.uid().raw() % 2 == 0;
        *storage = vm.branch(
            1,
            even,
            |vm| {
                vm.nbr(0, 1.0, |_, f: &Field<f64>| {
                    Ok(f.neighbour_count() as f64)
                })
            },
            |vm| {
                vm.nbr(0, 2.0, |_, f: &Field<f64>| {
                    Ok(f.neighbour_count() as f64)
                })
            },
        )?;
        Ok(())
    })
}

#[test]
fn branch_exports_contain_only_entered_arm() {
    let mut net = Net::builder(parity_program(), FullConnect)
        .seed(3)
        .retain_window(5.0)
        .build()
        .unwrap();
    for n in 0..4 {
        net.node_emplace_at(uid(n), 0.0).unwrap();
    }

    // One round each.
    net.run_until(SimTime::new(0.0)).unwrap();

    let collect = |n: u32| -> Vec<fieldcast::TraceHash> {
        net.node_at(uid(n)).unwrap().export().traces().collect()
    };
    let even_traces = collect(0);
    let odd_traces = collect(1);
    assert_eq!(even_traces, collect(2));
    assert_eq!(odd_traces, collect(3));
    assert!(!even_traces.is_empty());
    for t in &even_traces {
        assert!(!odd_traces.contains(t), "trace {t} leaked across arms");
    }
}

#[test]
fn branch_cross_parity_exchange_sees_no_neighbours() {
    let mut net = Net::builder(parity_program(), FullConnect)
        .seed(3)
        .retain_window(5.0)
        .build()
        .unwrap();
    for n in 0..4 {
        net.node_emplace_at(uid(n), 0.0).unwrap();
    }

    // Round two: fields are projected from round-one exports.
    net.run_until(SimTime::new(1.0)).unwrap();

    // Fully connected, four devices: each sees one same-parity
    // contributor, never the two cross-parity ones.
    for n in 0..4 {
        assert_eq!(
            *net.node_at(uid(n)).unwrap().storage(),
            1.0,
            "device {n} saw cross-parity contributors"
        );
    }
}

// ── Scenario 4: argmin tie-break on equal distances ──────────────────

#[test]
fn min_hood_tie_breaks_to_smaller_uid() {
    let program = program_fn(|vm: &mut RoundVm<'_>, storage: &mut f64| {
        let me = vm.uid();
        let dist = vm.nbr_field(1, 1.0f64)?;
        let who = vm.nbr_field(2, me)?;
        let chosen = dist.combine(&who, |d, u| (*d, u.raw())).min_hood().1;
        *storage = chosen as f64;
        Ok(())
    });
    let mut net = Net::builder(program, FullConnect)
        .seed(9)
        .retain_window(5.0)
        .build()
        .unwrap();
    net.node_emplace_at(uid(7), 0.0).unwrap();
    net.node_emplace_at(uid(11), 0.0).unwrap();

    net.run_until(SimTime::new(1.0)).unwrap();

    assert_eq!(*net.node_at(uid(7)).unwrap().storage(), 7.0);
    assert_eq!(*net.node_at(uid(11)).unwrap().storage(), 7.0);
}

// ── Scenario 5: parallel equivalence ─────────────────────────────────

fn spatial_run(threads: usize, buf: SharedBuf) -> Vec<f64> {
    let program = program_fn(|vm: &mut RoundVm<'_>, storage: &mut f64| {
        *storage = gossip_min(vm, 1, *storage)?;
        Ok(())
    });
    let mut net = Net::builder(program, fieldcast::DiskConnect::new(1.5))
        .seed(42)
        .threads(threads)
        .epsilon(0.0)
        .retain_window(5.0)
        .round(0.0, 1.0)
        .logger(
            LogSink::Writer(Box::new(buf)),
            vec![Aggregator::Min, Aggregator::Mean, Aggregator::Max],
            1.0,
        )
        .build()
        .unwrap();

    // A line of eight devices, reachable pairwise at distance 1.
    for (n, value) in [9.0, 4.0, 7.0, 1.0, 8.0, 6.0, 3.0, 5.0].iter().enumerate() {
        net.node_emplace_spatial(uid(n as u32), *value, [n as f64, 0.0], None)
            .unwrap();
    }

    net.run_until(SimTime::new(10.0)).unwrap();
    net.node_uids()
        .into_iter()
        .map(|u| *net.node_at(u).unwrap().storage())
        .collect()
}

#[test]
fn parallel_and_sequential_runs_are_identical() {
    let seq_buf = SharedBuf::default();
    let par_buf = SharedBuf::default();
    let seq = spatial_run(1, seq_buf.clone());
    let par = spatial_run(4, par_buf.clone());

    // Storage snapshots match device by device.
    assert_eq!(seq, par);
    // Every logged tick matches too.
    assert_eq!(seq_buf.data_rows(), par_buf.data_rows());
    assert!(!seq_buf.data_rows().is_empty());
    // The line converged to the global minimum.
    assert!(seq.iter().all(|v| *v == 1.0));
}

// ── Scenario 6: context eviction after silence ───────────────────────

#[derive(Clone)]
struct CountStorage {
    value: f64,
    heard: f64,
}

impl StorageRecord for CountStorage {
    fn tags() -> &'static [&'static str] {
        &["value", "heard"]
    }

    fn values(&self) -> Vec<f64> {
        vec![self.value, self.heard]
    }
}

#[test]
fn departed_neighbour_is_evicted_after_retain_window() {
    let program = program_fn(|vm: &mut RoundVm<'_>, storage: &mut CountStorage| {
        storage.heard = vm.nbr(1, storage.value, |_, f: &Field<f64>| {
            Ok(f.neighbour_count() as f64)
        })?;
        Ok(())
    });
    let mut net = Net::builder(program, FullConnect)
        .seed(5)
        .retain_window(5.0)
        .round(0.0, 1.0)
        .build()
        .unwrap();

    let a = net
        .node_emplace_at(
            uid(0),
            CountStorage {
                value: 1.0,
                heard: 0.0,
            },
        )
        .unwrap();
    let b = net
        .node_emplace_at(
            uid(1),
            CountStorage {
                value: 2.0,
                heard: 0.0,
            },
        )
        .unwrap();

    // Let b broadcast its round at T=10, then remove it.
    net.run_until(SimTime::new(10.0)).unwrap();
    net.node_erase(b).unwrap();

    // At T=11..15 the entry is still within the window.
    net.run_until(SimTime::new(15.0)).unwrap();
    {
        let device = net.node_at(a).unwrap();
        assert!(device.context().contains(b));
        assert_eq!(device.storage().heard, 1.0);
    }

    // At T=16 the reception time 10 falls outside retain_window 5:
    // no b entry, projections use defaults only.
    net.run_until(SimTime::new(16.0)).unwrap();
    let device = net.node_at(a).unwrap();
    assert!(!device.context().contains(b));
    assert_eq!(device.storage().heard, 0.0);
}

// ── Whole-net determinism ────────────────────────────────────────────

#[test]
fn identical_runs_produce_identical_traces_and_storage() {
    fn run() -> (Vec<Vec<fieldcast::TraceHash>>, Vec<f64>, u64) {
        let mut net = Net::builder(parity_program(), FullConnect)
            .seed(11)
            .retain_window(4.0)
            .round(0.0, 0.5)
            .build()
            .unwrap();
        for n in 0..5 {
            net.node_emplace_at(uid(n), 0.0).unwrap();
        }
        net.run_until(SimTime::new(6.0)).unwrap();
        let traces = net
            .node_uids()
            .into_iter()
            .map(|u| net.node_at(u).unwrap().export().traces().collect())
            .collect();
        let storage = net
            .node_uids()
            .into_iter()
            .map(|u| *net.node_at(u).unwrap().storage())
            .collect();
        (traces, storage, net.events_processed())
    }

    assert_eq!(run(), run());
}

// ── Graph input end to end ───────────────────────────────────────────

#[test]
fn graph_files_drive_a_batch_run() {
    let dir = tempfile::tempdir().unwrap();
    let nodes_path = dir.path().join("nodes.txt");
    let arcs_path = dir.path().join("arcs.txt");
    std::fs::write(&nodes_path, "0 5\n0 2\n1 9\n").unwrap();
    std::fs::write(&arcs_path, "0 1\n1 0\n1 2\n2 1\n").unwrap();

    let spawner = GraphSpawner::new(&["start", "value"]);
    let rows = spawner.read_nodes_path(&nodes_path).unwrap();
    assert_eq!(rows[2].start, Some(SimTime::new(1.0)));
    let arcs = fieldcast::read_arcs_path(&arcs_path).unwrap();

    let program = program_fn(|vm: &mut RoundVm<'_>, storage: &mut f64| {
        *storage = gossip_min(vm, 1, *storage)?;
        Ok(())
    });
    let log_path = dir.path().join("out.txt");
    let mut net = Net::builder(program, GraphConnect::from_arcs(arcs))
        .seed(2)
        .retain_window(5.0)
        .round(0.0, 1.0)
        .logger(
            LogSink::Path(log_path.clone()),
            vec![Aggregator::Min, Aggregator::Count],
            1.0,
        )
        .build()
        .unwrap();

    let spawned = net
        .spawn_rows(&rows, |row| {
            (row.get(&spawner, "value").unwrap(), None)
        })
        .unwrap();
    assert_eq!(spawned.len(), 3);

    net.run_until(SimTime::new(4.0)).unwrap();

    // The chain 0-1-2 converges to the global minimum 2.
    for u in net.node_uids() {
        assert_eq!(*net.node_at(u).unwrap().storage(), 2.0);
    }
    drop(net);

    let text = std::fs::read_to_string(&log_path).unwrap();
    assert!(text.contains("# time min(value) count(value)"));
    assert!(text.contains("# fieldcast data export finished at:"));
}

// ── Device API surface used by deployments ───────────────────────────

#[test]
fn device_receive_feeds_next_round() {
    // The connector-facing `receive` path: push an envelope directly
    // into a device's mailbox, as real-mode delivery does.
    use fieldcast::{encode_envelope, Envelope, Export, RoundSchedule, TraceHash};

    let mut device: Device<f64> = Device::new(
        uid(0),
        0.0,
        RoundSchedule::periodic(SimTime::ZERO, 1.0),
    );
    let mut export = Export::new();
    export.insert(TraceHash::new(9), &3.5f64);
    export.seal();

    // Round-trip the export through the wire format, as a transport
    // would.
    let wire = encode_envelope(uid(4), SimTime::new(0.25), &export);
    let (sender, send_time, parsed) = fieldcast::decode_envelope(&wire).unwrap();
    device.receive(Envelope {
        sender,
        send_time,
        arrival: send_time,
        export: Arc::new(parsed),
    });

    device.round_start(SimTime::new(1.0), 5.0);
    assert!(device.context().contains(uid(4)));
    let field = device
        .context()
        .project(TraceHash::new(9), 0.0f64)
        .unwrap();
    assert_eq!(*field.at(uid(4)), 3.5);
}

#[test]
fn log_dir_sink_names_file_from_net_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let program = program_fn(|vm: &mut RoundVm<'_>, storage: &mut f64| {
        *storage = gossip_min(vm, 1, *storage)?;
        Ok(())
    });
    let mut net = Net::builder(program, FullConnect)
        .name("scenario")
        .seed(6)
        .retain_window(2.0)
        .logger(
            LogSink::Dir(PathBuf::from(dir.path())),
            vec![Aggregator::Mean],
            1.0,
        )
        .build()
        .unwrap();
    net.node_emplace(4.0);
    net.run_until(SimTime::new(2.0)).unwrap();
    drop(net);

    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].starts_with("scenario_seed-6"));
    assert!(entries[0].ends_with(".txt"));
}
