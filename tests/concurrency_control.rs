use itertools::Itertools;
use lineair::{Config, ConcurrencyControlProtocol, Database, Transaction, TxStatus};
use rand::Rng;
use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering::SeqCst},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

const PROTOCOLS: [ConcurrencyControlProtocol; 2] = [
    ConcurrencyControlProtocol::Silo,
    ConcurrencyControlProtocol::SiloNwr,
];

fn open(protocol: ConcurrencyControlProtocol) -> Database {
    Database::open(Config {
        concurrency_control_protocol: protocol,
        epoch_duration_ms: 10,
        worker_threads: NonZeroUsize::new(4).unwrap(),
        enable_logging: false,
        enable_recovery: false,
        ..Default::default()
    })
    .unwrap()
}

fn run<F>(db: &Database, procedure: F) -> TxStatus
where
    F: FnOnce(&mut Transaction<'_, '_>) + Send + 'static,
{
    let (status_tx, status_rx) = mpsc::channel();
    db.execute_transaction(procedure, move |status| status_tx.send(status).unwrap());
    status_rx.recv().unwrap()
}

/// Submits all procedures without waiting in between, then fences and
/// returns how many of them committed.
fn run_concurrently(
    db: &Database,
    procedures: Vec<Box<dyn FnOnce(&mut Transaction<'_, '_>) + Send>>,
) -> usize {
    let committed = Arc::new(AtomicUsize::new(0));
    for procedure in procedures {
        let committed = committed.clone();
        db.execute_transaction(procedure, move |status| {
            if status == TxStatus::Committed {
                committed.fetch_add(1, SeqCst);
            }
        });
    }
    db.fence();
    committed.load(SeqCst)
}

fn read_i32(db: &Database, key: &'static [u8]) -> Option<i32> {
    let result = Arc::new(Mutex::new(None));
    let captured = result.clone();
    let status = run(db, move |tx| {
        *captured.lock().unwrap() = tx.read(key).map(to_i32);
    });
    assert_eq!(status, TxStatus::Committed);
    let value = *result.lock().unwrap();
    value
}

fn write_i32(db: &Database, key: &'static [u8], value: i32) {
    let status = run(db, move |tx| tx.write(key, &value.to_le_bytes()));
    assert_eq!(status, TxStatus::Committed);
}

fn to_i32(bytes: &[u8]) -> i32 {
    i32::from_le_bytes(bytes.try_into().unwrap())
}

#[test]
fn increment_under_contention() {
    for protocol in PROTOCOLS {
        let db = open(protocol);
        write_i32(&db, b"alice", 1);
        db.fence();

        let increment = || -> Box<dyn FnOnce(&mut Transaction<'_, '_>) + Send> {
            Box::new(|tx| {
                let current = to_i32(tx.read(b"alice").unwrap());
                std::thread::sleep(Duration::from_millis(1));
                tx.write(b"alice", &(current + 1).to_le_bytes());
            })
        };
        let committed = run_concurrently(&db, vec![increment(), increment()]);
        assert!((1..=2).contains(&committed));

        // Exactly the committed increments are visible.
        assert_eq!(read_i32(&db, b"alice"), Some(1 + committed as i32));
    }
}

#[test]
fn dirty_read_avoidance() {
    const KEYS: [&[u8]; 5] = [b"alice0", b"alice1", b"alice2", b"alice3", b"alice4"];

    for protocol in PROTOCOLS {
        let db = open(protocol);

        let insert_and_abort = || -> Box<dyn FnOnce(&mut Transaction<'_, '_>) + Send> {
            Box::new(|tx| {
                for key in KEYS {
                    tx.write(key, &0xBEEFi32.to_le_bytes());
                }
                tx.abort();
            })
        };

        let observed = Arc::new(Mutex::new(Vec::new()));
        let reader = |observed: Arc<Mutex<Vec<Option<i32>>>>| -> Box<
            dyn FnOnce(&mut Transaction<'_, '_>) + Send,
        > {
            Box::new(move |tx| {
                for key in KEYS {
                    observed.lock().unwrap().push(tx.read(key).map(to_i32));
                }
            })
        };

        let committed = run_concurrently(
            &db,
            vec![
                insert_and_abort(),
                insert_and_abort(),
                reader(observed.clone()),
                reader(observed.clone()),
            ],
        );
        // The writers abort themselves; the readers must commit.
        assert_eq!(committed, 2);
        for value in observed.lock().unwrap().iter() {
            assert_eq!(*value, None);
        }
    }
}

#[test]
fn repeatable_read_under_concurrent_updates() {
    for protocol in PROTOCOLS {
        let db = open(protocol);

        let update = || -> Box<dyn FnOnce(&mut Transaction<'_, '_>) + Send> {
            Box::new(|tx| {
                for i in 0..=10i32 {
                    tx.write(b"alice", &(0xBEEF + i).to_le_bytes());
                }
            })
        };

        let histories = Arc::new(Mutex::new(Vec::new()));
        let reader = |histories: Arc<Mutex<Vec<Vec<Option<i32>>>>>| -> Box<
            dyn FnOnce(&mut Transaction<'_, '_>) + Send,
        > {
            Box::new(move |tx| {
                let mut history = Vec::new();
                for _ in 0..=10 {
                    history.push(tx.read(b"alice").map(to_i32));
                }
                histories.lock().unwrap().push(history);
            })
        };

        run_concurrently(
            &db,
            vec![
                update(),
                update(),
                reader(histories.clone()),
                reader(histories.clone()),
            ],
        );

        for history in histories.lock().unwrap().iter() {
            let first = history[0];
            assert!(history.iter().all(|value| *value == first));
        }
    }
}

#[test]
fn write_skew_avoidance() {
    for protocol in PROTOCOLS {
        let db = open(protocol);
        let status = run(&db, |tx| {
            tx.write(b"alice", &0i32.to_le_bytes());
            tx.write(b"bob", &1i32.to_le_bytes());
        });
        assert_eq!(status, TxStatus::Committed);
        db.fence();

        let read_alice_write_bob = || -> Box<dyn FnOnce(&mut Transaction<'_, '_>) + Send> {
            Box::new(|tx| {
                let alice = to_i32(tx.read(b"alice").unwrap());
                tx.write(b"bob", &(alice + 1).to_le_bytes());
            })
        };
        let read_bob_write_alice = || -> Box<dyn FnOnce(&mut Transaction<'_, '_>) + Send> {
            Box::new(|tx| {
                let bob = to_i32(tx.read(b"bob").unwrap());
                tx.write(b"alice", &(bob + 1).to_le_bytes());
            })
        };

        let mut procedures: Vec<Box<dyn FnOnce(&mut Transaction<'_, '_>) + Send>> = Vec::new();
        for _ in 0..4 {
            procedures.push(read_alice_write_bob());
            procedures.push(read_bob_write_alice());
        }
        run_concurrently(&db, procedures);

        let alice = read_i32(&db, b"alice").unwrap();
        let bob = read_i32(&db, b"bob").unwrap();
        assert_eq!((alice - bob).abs(), 1);
    }
}

// Example 1.3 in Fekete et al., "Making Snapshot Isolation Serializable".
// If the read-only transaction T3 observes y = 20, it must also observe
// x = -11.
#[test]
fn read_only_anomaly_avoidance() {
    for protocol in PROTOCOLS {
        let db = open(protocol);

        let mut committed = 0;
        while committed != 3 {
            let status = run(&db, |tx| {
                tx.write(b"x", &0i32.to_le_bytes());
                tx.write(b"y", &0i32.to_le_bytes());
            });
            assert_eq!(status, TxStatus::Committed);
            db.fence();

            let waits = Arc::new(AtomicBool::new(true));
            let x_read_by_t3 = Arc::new(AtomicI32::new(0));
            let y_read_by_t3 = Arc::new(AtomicI32::new(0));

            // T1: r(y0) w(y := 20)
            let t1: Box<dyn FnOnce(&mut Transaction<'_, '_>) + Send> = {
                let waits = waits.clone();
                Box::new(move |tx| {
                    assert_eq!(tx.read(b"y").map(to_i32), Some(0));
                    while waits.load(SeqCst) {
                        std::thread::yield_now();
                    }
                    tx.write(b"y", &20i32.to_le_bytes());
                })
            };
            // T2: r(x0) r(y0) w(x := -11)
            let t2: Box<dyn FnOnce(&mut Transaction<'_, '_>) + Send> = {
                let waits = waits.clone();
                Box::new(move |tx| {
                    assert_eq!(tx.read(b"x").map(to_i32), Some(0));
                    assert_eq!(tx.read(b"y").map(to_i32), Some(0));
                    waits.store(false, SeqCst);
                    std::thread::yield_now();
                    tx.write(b"x", &(-11i32).to_le_bytes());
                })
            };
            // T3: r(x) r(y), aborting unless it sees T1's write.
            let t3: Box<dyn FnOnce(&mut Transaction<'_, '_>) + Send> = {
                let waits = waits.clone();
                let x_read_by_t3 = x_read_by_t3.clone();
                let y_read_by_t3 = y_read_by_t3.clone();
                Box::new(move |tx| {
                    while waits.load(SeqCst) {
                        std::thread::yield_now();
                    }
                    std::thread::yield_now();
                    let x = to_i32(tx.read(b"x").unwrap());
                    let y = to_i32(tx.read(b"y").unwrap());
                    if y != 20 {
                        tx.abort();
                        return;
                    }
                    x_read_by_t3.store(x, SeqCst);
                    y_read_by_t3.store(y, SeqCst);
                })
            };

            committed = run_concurrently(&db, vec![t1, t2, t3]);
            if committed == 3 {
                assert_eq!(x_read_by_t3.load(SeqCst), -11);
                assert_eq!(y_read_by_t3.load(SeqCst), 20);
            }
        }
    }
}

// Checks concurrent outcomes against every serial order of the committed
// transactions.
#[test]
fn outcomes_are_serializable() {
    const KEYS: [&[u8]; 2] = [b"x", b"y"];
    const ROUNDS: usize = 30;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Read(usize),
        Write(usize, i32),
    }

    let mut rng = rand::thread_rng();
    for protocol in PROTOCOLS {
        for round in 0..ROUNDS {
            let db = open(protocol);

            let scenario: Vec<Vec<Op>> = (0..3)
                .map(|_| {
                    (0..rng.gen_range(1..=3))
                        .map(|_| {
                            let key = rng.gen_range(0..KEYS.len());
                            if rng.gen_bool(0.5) {
                                Op::Read(key)
                            } else {
                                Op::Write(key, rng.gen_range(0..100))
                            }
                        })
                        .collect()
                })
                .collect();

            let histories: Vec<_> = (0..scenario.len())
                .map(|_| Arc::new(Mutex::new(Vec::new())))
                .collect();
            let committed = Arc::new(Mutex::new(Vec::new()));
            for (i, ops) in scenario.iter().enumerate() {
                let ops = ops.clone();
                let history = histories[i].clone();
                let committed = committed.clone();
                db.execute_transaction(
                    move |tx| {
                        for op in &ops {
                            match op {
                                Op::Read(key) => {
                                    let value = tx.read(KEYS[*key]).map(to_i32);
                                    history.lock().unwrap().push((*key, value));
                                }
                                Op::Write(key, value) => {
                                    tx.write(KEYS[*key], &value.to_le_bytes());
                                }
                            }
                        }
                    },
                    move |status| {
                        if status == TxStatus::Committed {
                            committed.lock().unwrap().push(i);
                        }
                    },
                );
            }
            db.fence();

            let committed = committed.lock().unwrap().clone();
            let mut final_state = BTreeMap::new();
            for (i, key) in KEYS.iter().enumerate() {
                if let Some(value) = read_i32(&db, *key) {
                    final_state.insert(i, value);
                }
            }

            let matches_some_serial_order =
                committed.iter().permutations(committed.len()).any(|order| {
                    let mut model = BTreeMap::new();
                    let mut model_histories: Vec<Vec<(usize, Option<i32>)>> =
                        vec![Vec::new(); scenario.len()];
                    for &&i in &order {
                        for op in &scenario[i] {
                            match op {
                                Op::Read(key) => {
                                    model_histories[i].push((*key, model.get(key).copied()));
                                }
                                Op::Write(key, value) => {
                                    model.insert(*key, *value);
                                }
                            }
                        }
                    }
                    model == final_state
                        && committed.iter().all(|&i| {
                            *histories[i].lock().unwrap() == model_histories[i]
                        })
                });
            assert!(
                matches_some_serial_order,
                "round {round}: no serial order matches; scenario: {scenario:?}"
            );
        }
    }
}
