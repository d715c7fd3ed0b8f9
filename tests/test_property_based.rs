//! Property-based tests for the signal queue and the buffer lists
//!
//! Random operation sequences run against the shared structures and a
//! `VecDeque` model side by side.


use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use mcc_mu::sema4::{AtomicGate, Gate};
use mcc_mu::shm::{ShmView, Signal, MAX_OUTSTANDING_SIGNALS, NUM_BUFFERS};
use mcc_mu::shm::SignalQueue;
use mcc_mu::{CoreId, Endpoint, MccError, PhysAddr, SharedMemory};
use proptest::prelude::*;
use proptest_strategies::*;

const BASE: u32 = 0x9000_0000;

// ════════════════════════════════════════════════════════════
// Signal Queue Properties
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Drains return exactly what was enqueued, in order, and a full queue
    /// rejects without disturbing the contents
    #[test]
    fn signal_queue_matches_model(ops in queue_ops()) {
        let queue = SignalQueue::new();
        let gate = Gate::new(Arc::new(AtomicGate::new()).handle(CoreId::HOST));
        let mut model: VecDeque<u32> = VecDeque::new();

        for op in ops {
            match op {
                QueueOp::Enqueue(port) => {
                    let signal = Signal::queued(Endpoint::new(CoreId::PEER, 0, port));
                    let result = queue.enqueue(signal);
                    if model.len() == MAX_OUTSTANDING_SIGNALS - 1 {
                        prop_assert_eq!(result, Err(MccError::SignalQueueFull { core: 1 }));
                    } else {
                        prop_assert_eq!(result, Ok(()));
                        model.push_back(port);
                    }
                }
                QueueOp::Drain(limit) => {
                    let held = gate.try_lock().unwrap();
                    let got: Vec<u32> = queue
                        .drain(&held)
                        .take(limit)
                        .map(|s| s.destination.port)
                        .collect();
                    let n = got.len();
                    let expected: Vec<u32> = model.drain(..n).collect();
                    prop_assert_eq!(got, expected);
                    prop_assert_eq!(n, limit.min(n + model.len()));
                }
            }
            prop_assert_eq!(queue.len(), model.len());
        }
    }

    /// Draining an empty queue any number of times changes nothing
    #[test]
    fn empty_drain_is_idempotent(fill in 0usize..MAX_OUTSTANDING_SIGNALS, repeats in 1usize..10) {
        let queue = SignalQueue::new();
        let gate = Gate::new(Arc::new(AtomicGate::new()).handle(CoreId::HOST));
        for _ in 0..fill {
            if queue.enqueue(Signal::freed(CoreId::HOST)).is_err() {
                break;
            }
        }
        let held = gate.try_lock().unwrap();
        queue.drain(&held).for_each(drop);
        let settled = queue.indices();
        for _ in 0..repeats {
            prop_assert_eq!(queue.drain(&held).count(), 0);
            prop_assert_eq!(queue.indices(), settled);
        }
        prop_assert_eq!(settled.0, settled.1);
    }
}

// ════════════════════════════════════════════════════════════
// Buffer List Properties
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Buffers keep FIFO order per list and are never in two places
    #[test]
    fn buffers_are_conserved(ops in list_ops()) {
        let shm = Box::new(SharedMemory::new());
        let view = ShmView::new(&shm, BASE);
        let gate = Gate::new(Arc::new(AtomicGate::new()).handle(CoreId::HOST));
        let held = gate.try_lock().unwrap();
        view.format(&held);

        let eps = [
            Endpoint::new(CoreId::HOST, 0, 1),
            Endpoint::new(CoreId::PEER, 0, 1),
        ];
        for ep in eps {
            view.register_endpoint(&held, ep).unwrap();
        }
        let mut free: VecDeque<PhysAddr> = (0..NUM_BUFFERS).map(|i| view.phys_of(i)).collect();
        let mut queued: [VecDeque<PhysAddr>; 2] = Default::default();

        for op in ops {
            match op {
                ListOp::Deliver(n) => {
                    let popped = view.free_list().pop_front(&view, &held);
                    prop_assert_eq!(popped, free.pop_front());
                    if let Some(phys) = popped {
                        view.endpoint_list(&held, eps[n]).unwrap().push_back(&view, &held, phys);
                        queued[n].push_back(phys);
                    }
                }
                ListOp::Consume(n) => {
                    let popped = view.endpoint_list(&held, eps[n]).unwrap().pop_front(&view, &held);
                    prop_assert_eq!(popped, queued[n].pop_front());
                    if let Some(phys) = popped {
                        view.free_list().push_back(&view, &held, phys);
                        free.push_back(phys);
                    }
                }
            }
        }

        let total = view.free_list().len(&view, &held)
            + eps
                .iter()
                .map(|ep| view.endpoint_list(&held, *ep).unwrap().len(&view, &held))
                .sum::<usize>();
        prop_assert_eq!(total, NUM_BUFFERS);

        let mut seen = HashSet::new();
        for list in [view.free_list(), view.endpoint_list(&held, eps[0]).unwrap(), view.endpoint_list(&held, eps[1]).unwrap()] {
            while let Some(phys) = list.pop_front(&view, &held) {
                prop_assert!(seen.insert(phys), "{} linked twice", phys);
            }
        }
        prop_assert_eq!(seen.len(), NUM_BUFFERS);
    }
}
