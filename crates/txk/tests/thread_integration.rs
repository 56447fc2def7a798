//! Thread-level behaviour of the kernel: blocking services driven through
//! the dispatcher, the timer tick and the scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use txk::trace::records;
use txk::{
    Blocking, ByteBlock, EventOption, Kernel, KernelBuilder, KernelConfig, KernelError,
    KernelResult, MemoryBlock, Message, MutexId, QueueNotify, SemaphoreId, SemaphoreNotify,
    SetOption, ThreadAction, ThreadConfig, ThreadContext, ThreadId, ThreadState, Timeout,
    WakePayload, WakeResult,
};

type Log = Arc<Mutex<Vec<(&'static str, WakeResult)>>>;
type Trail = Arc<Mutex<Vec<&'static str>>>;

fn kernel() -> Kernel {
    KernelBuilder::new().build().expect("kernel")
}

fn payload<T>(
    result: KernelResult<Blocking<T>>,
    wrap: impl FnOnce(T) -> WakePayload,
) -> KernelResult<Blocking<WakePayload>> {
    result.map(|blocking| match blocking {
        Blocking::Complete(value) => Blocking::Complete(wrap(value)),
        Blocking::Suspended => Blocking::Suspended,
    })
}

/// Body that issues one blocking call and records its outcome, whether it
/// completed at once or after a wait.
fn waiter<W>(
    log: &Log,
    name: &'static str,
    mut wait: W,
) -> impl FnMut(&mut ThreadContext<'_>) -> ThreadAction + Send + 'static
where
    W: FnMut(&Kernel) -> KernelResult<Blocking<WakePayload>> + Send + 'static,
{
    let log = Arc::clone(log);
    move |ctx| {
        if let Some(result) = ctx.take_wake() {
            log.lock().unwrap().push((name, result));
            return ThreadAction::Complete;
        }
        match wait(ctx.kernel()) {
            Ok(Blocking::Suspended) => ThreadAction::Continue,
            Ok(Blocking::Complete(value)) => {
                log.lock().unwrap().push((name, Ok(value)));
                ThreadAction::Complete
            }
            Err(err) => {
                log.lock().unwrap().push((name, Err(err)));
                ThreadAction::Complete
            }
        }
    }
}

/// Body that records its name on every run and completes.
fn once(
    trail: &Trail,
    name: &'static str,
) -> impl FnMut(&mut ThreadContext<'_>) -> ThreadAction + Send + 'static {
    let trail = Arc::clone(trail);
    move |_| {
        trail.lock().unwrap().push(name);
        ThreadAction::Complete
    }
}

fn entries(log: &Log) -> Vec<(&'static str, WakeResult)> {
    log.lock().unwrap().clone()
}

#[test]
fn semaphore_put_resumes_waiter() -> Result<(), KernelError> {
    let kernel = kernel();
    let log = Log::default();
    let sem = kernel.semaphore_create("s", 0)?;
    kernel.thread_create(ThreadConfig::new(
        "a",
        5,
        waiter(&log, "a", move |k| {
            payload(k.semaphore_get(sem, Timeout::Forever), |()| WakePayload::None)
        }),
    ))?;
    kernel.thread_create(ThreadConfig::new("b", 10, move |ctx| {
        let _ = ctx.kernel().semaphore_put(sem);
        ThreadAction::Complete
    }))?;

    kernel.start();
    kernel.run(16);

    assert_eq!(entries(&log), vec![("a", Ok(WakePayload::None))]);
    assert_eq!(kernel.semaphore_info(sem)?.count, 0);
    Ok(())
}

#[test]
fn full_queue_rejects_no_wait_send() -> Result<(), KernelError> {
    let kernel = kernel();
    let queue = kernel.queue_create("q", 1, 1)?;

    assert_eq!(kernel.queue_send(queue, &[1], Timeout::NoWait)?, Blocking::Complete(()));
    assert_eq!(kernel.queue_info(queue)?.enqueued, 1);
    assert_eq!(
        kernel.queue_send(queue, &[2], Timeout::NoWait),
        Err(KernelError::QueueFull)
    );

    let received = kernel.queue_receive(queue, Timeout::NoWait)?.complete();
    assert_eq!(received.as_deref(), Some(&[1u32][..]));
    assert_eq!(kernel.queue_info(queue)?.enqueued, 0);
    Ok(())
}

#[test]
fn byte_pool_reuses_released_block() -> Result<(), KernelError> {
    let kernel = kernel();
    let pool = kernel.byte_pool_create("bytes", 100)?;
    let allocate = |size: usize| -> KernelResult<ByteBlock> {
        kernel
            .byte_allocate(pool, size, Timeout::NoWait)?
            .complete()
            .ok_or(KernelError::NoMemory)
    };

    let first = allocate(40)?;
    let second = allocate(40)?;
    assert_eq!(allocate(40), Err(KernelError::NoMemory));

    kernel.byte_release(first)?;
    let third = allocate(40)?;
    assert!(third.len() >= 40);

    kernel.byte_release(second)?;
    kernel.byte_release(third)?;
    let stats = kernel.byte_pool_stats(pool)?;
    assert_eq!(stats.fragments, 2);
    assert_eq!(stats.available, 100 - 8);
    Ok(())
}

#[test]
fn mutex_owner_inherits_waiter_priority() -> Result<(), KernelError> {
    let kernel = kernel();
    let go = kernel.semaphore_create("go", 0)?;
    let mutex = kernel.mutex_create("m", true)?;
    let owner = kernel.thread_create(ThreadConfig::new("owner", 20, move |ctx| {
        let k = ctx.kernel();
        if ctx.take_wake().is_some() {
            let _ = k.mutex_put(mutex);
            return ThreadAction::Complete;
        }
        let _ = k.mutex_get(mutex, Timeout::NoWait);
        match k.semaphore_get(go, Timeout::Forever) {
            Ok(Blocking::Suspended) => ThreadAction::Continue,
            _ => ThreadAction::Complete,
        }
    }))?;

    kernel.start();
    kernel.run(8);
    assert_eq!(kernel.mutex_info(mutex)?.owner, Some(owner));

    let log = Log::default();
    let blocked = kernel.thread_create(ThreadConfig::new(
        "waiter",
        5,
        waiter(&log, "waiter", move |k| {
            payload(k.mutex_get(mutex, Timeout::Forever), |()| WakePayload::None)
        }),
    ))?;
    kernel.run(8);

    let info = kernel.thread_info(owner)?;
    assert_eq!(info.priority, 5);
    assert_eq!(info.user_priority, 20);

    // Only the owner is ready; one step runs its put.
    kernel.semaphore_put(go)?;
    kernel.step();
    assert_eq!(kernel.thread_info(owner)?.priority, 20);
    assert_eq!(kernel.thread_info(owner)?.state, ThreadState::Completed);
    assert_eq!(kernel.mutex_info(mutex)?.owner, Some(blocked));

    kernel.run(8);
    assert_eq!(entries(&log), vec![("waiter", Ok(WakePayload::None))]);
    assert_eq!(kernel.mutex_info(mutex)?.owner, None);
    Ok(())
}

#[test]
fn deleting_semaphore_releases_every_waiter() -> Result<(), KernelError> {
    let kernel = kernel();
    let log = Log::default();
    let sem = kernel.semaphore_create("s", 0)?;
    for (name, priority) in [("a", 5), ("b", 6), ("c", 7)] {
        kernel.thread_create(ThreadConfig::new(
            name,
            priority,
            waiter(&log, name, move |k| {
                payload(k.semaphore_get(sem, Timeout::Forever), |()| WakePayload::None)
            }),
        ))?;
    }
    kernel.start();
    kernel.run(8);
    assert_eq!(kernel.semaphore_info(sem)?.suspended_count, 3);

    kernel.semaphore_delete(sem)?;
    kernel.run(8);

    assert_eq!(
        entries(&log),
        vec![
            ("a", Err(KernelError::Deleted)),
            ("b", Err(KernelError::Deleted)),
            ("c", Err(KernelError::Deleted)),
        ]
    );
    assert_eq!(kernel.semaphore_info(sem), Err(KernelError::SemaphoreError));
    Ok(())
}

#[test]
fn equal_priority_waiters_resume_in_arrival_order() -> Result<(), KernelError> {
    let kernel = kernel();
    let log = Log::default();
    let sem = kernel.semaphore_create("s", 0)?;
    for name in ["a", "b", "c"] {
        kernel.thread_create(ThreadConfig::new(
            name,
            8,
            waiter(&log, name, move |k| {
                payload(k.semaphore_get(sem, Timeout::Forever), |()| WakePayload::None)
            }),
        ))?;
    }
    kernel.start();
    kernel.run(8);

    for _ in 0..3 {
        kernel.semaphore_put(sem)?;
        kernel.run(4);
    }
    let order: Vec<_> = entries(&log).into_iter().map(|(name, _)| name).collect();
    assert_eq!(order, ["a", "b", "c"]);
    Ok(())
}

#[test]
fn timeouts_report_the_service_status() -> Result<(), KernelError> {
    let kernel = kernel();
    let log = Log::default();
    let sem = kernel.semaphore_create("s", 0)?;
    let queue = kernel.queue_create("q", 1, 2)?;
    let group = kernel.event_flags_create("ev")?;
    let blocks = kernel.block_pool_create("blocks", 16, 1)?;
    let mutex = kernel.mutex_create("m", false)?;
    let _held = kernel.block_allocate(blocks, Timeout::NoWait)?;

    kernel.thread_create(ThreadConfig::new("owner", 3, move |ctx| {
        let k = ctx.kernel();
        let _ = k.mutex_get(mutex, Timeout::NoWait);
        let _ = k.thread_suspend(ctx.id());
        ThreadAction::Continue
    }))?;
    let wait = Timeout::Ticks(2);
    kernel.thread_create(ThreadConfig::new(
        "sem",
        10,
        waiter(&log, "sem", move |k| payload(k.semaphore_get(sem, wait), |()| WakePayload::None)),
    ))?;
    kernel.thread_create(ThreadConfig::new(
        "queue",
        11,
        waiter(&log, "queue", move |k| payload(k.queue_receive(queue, wait), WakePayload::Message)),
    ))?;
    kernel.thread_create(ThreadConfig::new(
        "flags",
        12,
        waiter(&log, "flags", move |k| {
            payload(k.event_flags_get(group, 1, EventOption::Or, wait), WakePayload::Flags)
        }),
    ))?;
    kernel.thread_create(ThreadConfig::new(
        "block",
        13,
        waiter(&log, "block", move |k| payload(k.block_allocate(blocks, wait), WakePayload::Block)),
    ))?;
    kernel.thread_create(ThreadConfig::new(
        "mutex",
        14,
        waiter(&log, "mutex", move |k| payload(k.mutex_get(mutex, wait), |()| WakePayload::None)),
    ))?;

    kernel.start();
    kernel.run(16);
    assert!(entries(&log).is_empty());

    for _ in 0..3 {
        kernel.tick();
    }
    kernel.run(16);

    assert_eq!(
        entries(&log),
        vec![
            ("sem", Err(KernelError::NoInstance)),
            ("queue", Err(KernelError::QueueEmpty)),
            ("flags", Err(KernelError::NoEvents)),
            ("block", Err(KernelError::NoMemory)),
            ("mutex", Err(KernelError::NotAvailable)),
        ]
    );
    Ok(())
}

#[test]
fn wait_abort_and_sleep() -> Result<(), KernelError> {
    let kernel = kernel();
    let log = Log::default();
    let sem = kernel.semaphore_create("s", 0)?;
    let blocked = kernel.thread_create(ThreadConfig::new(
        "blocked",
        5,
        waiter(&log, "blocked", move |k| {
            payload(k.semaphore_get(sem, Timeout::Forever), |()| WakePayload::None)
        }),
    ))?;
    kernel.thread_create(ThreadConfig::new(
        "sleeper",
        6,
        waiter(&log, "sleeper", |k| payload(k.thread_sleep(2), |()| WakePayload::None)),
    ))?;
    kernel.start();
    kernel.run(8);
    assert_eq!(kernel.thread_info(blocked)?.state, ThreadState::SemaphoreSusp);

    kernel.thread_wait_abort(blocked)?;
    kernel.run(8);
    assert_eq!(entries(&log), vec![("blocked", Err(KernelError::WaitAborted))]);
    assert_eq!(kernel.thread_wait_abort(blocked), Err(KernelError::WaitAbortError));

    kernel.tick();
    kernel.tick();
    kernel.run(8);
    assert_eq!(entries(&log)[1], ("sleeper", Ok(WakePayload::None)));
    Ok(())
}

#[test]
fn suspension_requested_while_waiting_is_delayed() -> Result<(), KernelError> {
    let kernel = kernel();
    let log = Log::default();
    let sem = kernel.semaphore_create("s", 0)?;
    let thread = kernel.thread_create(ThreadConfig::new(
        "w",
        5,
        waiter(&log, "w", move |k| {
            payload(k.semaphore_get(sem, Timeout::Forever), |()| WakePayload::None)
        }),
    ))?;
    kernel.start();
    kernel.run(4);

    kernel.thread_suspend(thread)?;
    assert!(kernel.thread_info(thread)?.delayed_suspend);
    kernel.semaphore_put(sem)?;
    assert_eq!(kernel.thread_info(thread)?.state, ThreadState::Suspended);
    kernel.run(4);
    assert!(entries(&log).is_empty());

    kernel.thread_resume(thread)?;
    kernel.run(4);
    assert_eq!(entries(&log), vec![("w", Ok(WakePayload::None))]);
    Ok(())
}

#[test]
fn preemption_threshold_holds_off_middle_priorities() -> Result<(), KernelError> {
    let kernel = kernel();
    let trail = Trail::default();
    let low = kernel.thread_create(
        ThreadConfig::new("low", 20, once(&trail, "low")).with_preemption_threshold(10),
    )?;
    kernel.start();
    assert_eq!(kernel.current_thread(0), Some(low));

    kernel.thread_create(ThreadConfig::new("mid", 15, once(&trail, "mid")))?;
    assert_eq!(kernel.current_thread(0), Some(low));

    let high = kernel.thread_create(ThreadConfig::new("high", 5, once(&trail, "high")))?;
    assert_eq!(kernel.current_thread(0), Some(high));

    kernel.run(8);
    // The preempted threshold thread goes back in ahead of "mid".
    assert_eq!(*trail.lock().unwrap(), ["high", "low", "mid"]);
    Ok(())
}

#[test]
fn queue_front_send_and_flush() -> Result<(), KernelError> {
    let kernel = kernel();
    let queue = kernel.queue_create("q", 1, 3)?;
    let _ = kernel.queue_send(queue, &[1], Timeout::NoWait)?;
    let _ = kernel.queue_send(queue, &[2], Timeout::NoWait)?;
    let _ = kernel.queue_front_send(queue, &[9], Timeout::NoWait)?;
    let mut order = Vec::new();
    while let Ok(Blocking::Complete(message)) = kernel.queue_receive(queue, Timeout::NoWait) {
        order.push(message[0]);
    }
    assert_eq!(order, [9, 1, 2]);

    // A receiver stays blocked across a flush of the empty queue.
    let log = Log::default();
    kernel.thread_create(ThreadConfig::new(
        "rx",
        5,
        waiter(&log, "rx", move |k| payload(k.queue_receive(queue, Timeout::Forever), WakePayload::Message)),
    ))?;
    kernel.start();
    kernel.run(4);
    kernel.queue_flush(queue)?;
    assert_eq!(kernel.queue_info(queue)?.suspended_count, 1);

    let _ = kernel.queue_send(queue, &[7], Timeout::NoWait)?;
    kernel.run(4);
    let expected = Message::from_slice(&[7]).expect("message");
    assert_eq!(entries(&log), vec![("rx", Ok(WakePayload::Message(expected)))]);
    assert_eq!(kernel.queue_info(queue)?.enqueued, 0);
    Ok(())
}

#[test]
fn receive_takes_front_sender_message_first() -> Result<(), KernelError> {
    let kernel = kernel();
    let log = Log::default();
    let queue = kernel.queue_create("q", 1, 2)?;
    let _ = kernel.queue_send(queue, &[1], Timeout::NoWait)?;
    let _ = kernel.queue_send(queue, &[2], Timeout::NoWait)?;
    kernel.thread_create(ThreadConfig::new(
        "back",
        5,
        waiter(&log, "back", move |k| payload(k.queue_send(queue, &[3], Timeout::Forever), |()| WakePayload::None)),
    ))?;
    kernel.start();
    kernel.run(4);
    kernel.thread_create(ThreadConfig::new(
        "front",
        6,
        waiter(&log, "front", move |k| {
            payload(k.queue_front_send(queue, &[9], Timeout::Forever), |()| WakePayload::None)
        }),
    ))?;
    kernel.run(4);
    assert_eq!(kernel.queue_info(queue)?.suspended_count, 2);

    let first = kernel.queue_receive(queue, Timeout::NoWait)?.complete();
    assert_eq!(first.as_deref(), Some(&[9u32][..]));
    // The front sender's message never touched storage.
    let info = kernel.queue_info(queue)?;
    assert_eq!((info.enqueued, info.suspended_count), (2, 1));

    let mut order = Vec::new();
    while let Ok(Blocking::Complete(message)) = kernel.queue_receive(queue, Timeout::NoWait) {
        order.push(message[0]);
    }
    assert_eq!(order, [1, 2, 3]);

    kernel.run(8);
    assert_eq!(
        entries(&log),
        vec![("back", Ok(WakePayload::None)), ("front", Ok(WakePayload::None))]
    );
    Ok(())
}

#[test]
fn send_notify_fires_per_accepted_message() -> Result<(), KernelError> {
    let kernel = kernel();
    let queue = kernel.queue_create("q", 1, 1)?;
    let sent = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&sent);
    let notify: QueueNotify = Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    kernel.queue_send_notify(queue, Some(notify))?;

    let _ = kernel.queue_send(queue, &[1], Timeout::NoWait)?;
    assert_eq!(
        kernel.queue_send(queue, &[2], Timeout::NoWait),
        Err(KernelError::QueueFull)
    );
    assert_eq!(sent.load(Ordering::SeqCst), 1);

    kernel.queue_send_notify(queue, None)?;
    let _ = kernel.queue_receive(queue, Timeout::NoWait)?;
    let _ = kernel.queue_send(queue, &[3], Timeout::NoWait)?;
    assert_eq!(sent.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn flush_resumes_blocked_senders() -> Result<(), KernelError> {
    let kernel = kernel();
    let log = Log::default();
    let queue = kernel.queue_create("q", 1, 1)?;
    let _ = kernel.queue_send(queue, &[1], Timeout::NoWait)?;
    kernel.thread_create(ThreadConfig::new(
        "tx",
        5,
        waiter(&log, "tx", move |k| payload(k.queue_send(queue, &[2], Timeout::Forever), |()| WakePayload::None)),
    ))?;
    kernel.start();
    kernel.run(4);
    assert_eq!(kernel.queue_info(queue)?.suspended_count, 1);

    kernel.queue_flush(queue)?;
    kernel.run(4);
    assert_eq!(entries(&log), vec![("tx", Ok(WakePayload::None))]);
    let info = kernel.queue_info(queue)?;
    assert_eq!((info.enqueued, info.suspended_count), (0, 0));
    Ok(())
}

#[test]
fn event_flags_wake_and_consume() -> Result<(), KernelError> {
    let kernel = kernel();
    let log = Log::default();
    let group = kernel.event_flags_create("ev")?;
    kernel.thread_create(ThreadConfig::new(
        "and",
        5,
        waiter(&log, "and", move |k| {
            payload(
                k.event_flags_get(group, 0b011, EventOption::AndClear, Timeout::Forever),
                WakePayload::Flags,
            )
        }),
    ))?;
    kernel.thread_create(ThreadConfig::new(
        "or",
        6,
        waiter(&log, "or", move |k| {
            payload(k.event_flags_get(group, 0b100, EventOption::Or, Timeout::Forever), WakePayload::Flags)
        }),
    ))?;
    kernel.start();
    kernel.run(8);

    kernel.event_flags_set(group, 0b001, SetOption::Or)?;
    assert_eq!(kernel.event_flags_info(group)?.suspended_count, 2);
    kernel.event_flags_set(group, 0b010, SetOption::Or)?;
    assert_eq!(kernel.event_flags_info(group)?.current, 0);
    kernel.event_flags_set(group, 0b100, SetOption::Or)?;
    assert_eq!(kernel.event_flags_info(group)?.current, 0b100);
    kernel.run(8);

    assert_eq!(
        entries(&log),
        vec![
            ("and", Ok(WakePayload::Flags(0b011))),
            ("or", Ok(WakePayload::Flags(0b100))),
        ]
    );
    Ok(())
}

#[test]
fn released_block_goes_to_waiter() -> Result<(), KernelError> {
    let kernel = kernel();
    let log = Log::default();
    let pool = kernel.block_pool_create("blocks", 32, 1)?;
    let block = kernel
        .block_allocate(pool, Timeout::NoWait)?
        .complete()
        .ok_or(KernelError::NoMemory)?;
    kernel.thread_create(ThreadConfig::new(
        "w",
        5,
        waiter(&log, "w", move |k| payload(k.block_allocate(pool, Timeout::Forever), WakePayload::Block)),
    ))?;
    kernel.start();
    kernel.run(4);

    kernel.block_release(block.clone())?;
    kernel.run(4);
    assert_eq!(entries(&log), vec![("w", Ok(WakePayload::Block(block)))]);
    assert_eq!(kernel.block_pool_stats(pool)?.free, 0);
    Ok(())
}

#[test]
fn smp_places_threads_by_priority_and_affinity() -> Result<(), KernelError> {
    let config = KernelConfig::builder().cores(2).build().expect("config");
    let kernel = KernelBuilder::new().with_config(config).build().expect("kernel");
    let trail = Trail::default();

    let a = kernel.thread_create(ThreadConfig::new("a", 5, once(&trail, "a")))?;
    assert_eq!(kernel.execute_list(), vec![Some(a), None]);
    kernel.thread_smp_core_exclude(a, 0b01)?;
    assert_eq!(kernel.execute_list(), vec![None, Some(a)]);

    let b = kernel.thread_create(ThreadConfig::new("b", 6, once(&trail, "b")))?;
    let c = kernel.thread_create(ThreadConfig::new("c", 7, once(&trail, "c")))?;
    assert_eq!(kernel.execute_list(), vec![Some(b), Some(a)]);

    kernel.thread_terminate(b)?;
    assert_eq!(kernel.execute_list(), vec![Some(c), Some(a)]);

    // Confined to the core "a" holds, "c" has nowhere to run.
    kernel.thread_smp_core_exclude(c, 0b01)?;
    assert_eq!(kernel.execute_list(), vec![None, Some(a)]);

    kernel.start();
    kernel.run(8);
    assert_eq!(*trail.lock().unwrap(), ["a", "c"]);
    Ok(())
}

#[test]
fn time_slice_rotates_equal_priorities() -> Result<(), KernelError> {
    let kernel = kernel();
    let trail = Trail::default();
    for name in ["a", "b"] {
        let trail = Arc::clone(&trail);
        kernel.thread_create(
            ThreadConfig::new(name, 10, move |_| {
                trail.lock().unwrap().push(name);
                ThreadAction::Continue
            })
            .with_time_slice(2),
        )?;
    }
    kernel.start();
    kernel.step();
    kernel.tick();
    kernel.step();
    kernel.tick();
    kernel.step();
    assert_eq!(*trail.lock().unwrap(), ["a", "a", "b"]);
    Ok(())
}

#[test]
fn stack_overflow_reaches_notify() -> Result<(), KernelError> {
    let kernel = kernel();
    let overflowed: Arc<Mutex<Vec<ThreadId>>> = Arc::default();
    let sink = Arc::clone(&overflowed);
    kernel.thread_stack_error_notify(Some(Arc::new(move |thread| sink.lock().unwrap().push(thread))));

    let thread = kernel.thread_create(
        ThreadConfig::new("deep", 5, |ctx| {
            ctx.use_stack(4096);
            ThreadAction::Complete
        })
        .with_stack_size(256),
    )?;
    kernel.start();
    kernel.run(4);
    assert_eq!(*overflowed.lock().unwrap(), [thread]);
    Ok(())
}

static FATAL: AtomicUsize = AtomicUsize::new(0);

fn count_fatal(_: &txk::FatalError) {
    FATAL.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn stack_overflow_without_notify_uses_error_handler() -> Result<(), KernelError> {
    let config = KernelConfig::builder().error_handler(count_fatal).build().expect("config");
    let kernel = KernelBuilder::new().with_config(config).build().expect("kernel");
    kernel.thread_create(
        ThreadConfig::new("deep", 5, |ctx| {
            ctx.use_stack(4096);
            ThreadAction::Complete
        })
        .with_stack_size(256),
    )?;
    kernel.start();
    kernel.run(4);
    assert_eq!(FATAL.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn services_emit_trace_records() -> Result<(), KernelError> {
    let (hook, backend) = txs::memory_hook(64);
    let kernel = KernelBuilder::new().with_trace_hook(hook).build().expect("kernel");
    let sem = kernel.semaphore_create("s", 1)?;
    let _ = kernel.semaphore_get(sem, Timeout::NoWait)?;
    kernel.semaphore_put(sem)?;

    assert_eq!(backend.records_of(records::semaphore::CREATE).len(), 1);
    assert_eq!(backend.records_of(records::semaphore::GET).len(), 1);
    assert_eq!(backend.records_of(records::semaphore::PUT).len(), 1);
    Ok(())
}

#[test]
fn recursive_mutex_owned_until_count_returns_to_zero() -> Result<(), KernelError> {
    let kernel = kernel();
    let mutex = kernel.mutex_create("m", false)?;
    let samples = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&samples);
    kernel.thread_create(ThreadConfig::new("owner", 5, move |ctx| {
        let k = ctx.kernel();
        let sample = |status: KernelResult<()>| {
            let info = k.mutex_info(mutex).map(|info| (info.ownership_count, info.owner.is_some()));
            (status, info)
        };
        let mut seen = seen.lock().unwrap();
        for _ in 0..3 {
            let status = k.mutex_get(mutex, Timeout::NoWait).map(|_| ());
            seen.push(sample(status));
        }
        for _ in 0..4 {
            let status = k.mutex_put(mutex);
            seen.push(sample(status));
        }
        ThreadAction::Complete
    }))?;
    kernel.start();
    kernel.run(4);

    assert_eq!(
        *samples.lock().unwrap(),
        vec![
            (Ok(()), Ok((1, true))),
            (Ok(()), Ok((2, true))),
            (Ok(()), Ok((3, true))),
            (Ok(()), Ok((2, true))),
            (Ok(()), Ok((1, true))),
            (Ok(()), Ok((0, false))),
            (Err(KernelError::NotOwned), Ok((0, false))),
        ]
    );
    Ok(())
}

/// Owner at priority 20 holding `mutex`, parked on `go` until released.
fn mutex_holder(
    kernel: &Kernel,
    mutex: MutexId,
    go: SemaphoreId,
) -> KernelResult<ThreadId> {
    kernel.thread_create(ThreadConfig::new("owner", 20, move |ctx| {
        let k = ctx.kernel();
        if ctx.take_wake().is_some() {
            let _ = k.mutex_put(mutex);
            return ThreadAction::Complete;
        }
        let _ = k.mutex_get(mutex, Timeout::NoWait);
        match k.semaphore_get(go, Timeout::Forever) {
            Ok(Blocking::Suspended) => ThreadAction::Continue,
            _ => ThreadAction::Complete,
        }
    }))
}

#[test]
fn deleting_owned_mutex_restores_owner_and_fails_waiters() -> Result<(), KernelError> {
    let kernel = kernel();
    let log = Log::default();
    let go = kernel.semaphore_create("go", 0)?;
    let mutex = kernel.mutex_create("m", true)?;
    let owner = mutex_holder(&kernel, mutex, go)?;
    kernel.start();
    kernel.run(4);

    for (name, priority) in [("w5", 5), ("w8", 8)] {
        kernel.thread_create(ThreadConfig::new(
            name,
            priority,
            waiter(&log, name, move |k| payload(k.mutex_get(mutex, Timeout::Forever), |()| WakePayload::None)),
        ))?;
    }
    kernel.run(8);
    assert_eq!(kernel.thread_info(owner)?.priority, 5);
    assert_eq!(kernel.mutex_info(mutex)?.suspended_count, 2);

    kernel.mutex_delete(mutex)?;
    let info = kernel.thread_info(owner)?;
    assert_eq!((info.priority, info.owned_mutexes), (20, 0));
    assert_eq!(kernel.mutex_info(mutex), Err(KernelError::MutexError));

    kernel.run(8);
    assert_eq!(
        entries(&log),
        vec![("w5", Err(KernelError::Deleted)), ("w8", Err(KernelError::Deleted))]
    );
    Ok(())
}

#[test]
fn inherited_priority_survives_user_changes() -> Result<(), KernelError> {
    let kernel = kernel();
    let log = Log::default();
    let go = kernel.semaphore_create("go", 0)?;
    let mutex = kernel.mutex_create("m", true)?;
    let owner = mutex_holder(&kernel, mutex, go)?;
    kernel.start();
    kernel.run(4);
    let blocked = kernel.thread_create(ThreadConfig::new(
        "waiter",
        5,
        waiter(&log, "waiter", move |k| payload(k.mutex_get(mutex, Timeout::Forever), |()| WakePayload::None)),
    ))?;
    kernel.run(8);

    assert_eq!(kernel.thread_priority_change(owner, 25)?, 20);
    let info = kernel.thread_info(owner)?;
    assert_eq!((info.priority, info.user_priority), (5, 25));

    assert_eq!(kernel.thread_priority_change(owner, 3)?, 25);
    assert_eq!(kernel.thread_info(owner)?.priority, 3);
    assert_eq!(kernel.thread_priority_change(owner, 25)?, 3);
    assert_eq!(kernel.thread_info(owner)?.priority, 5);

    assert_eq!(
        kernel.thread_preemption_change(owner, 30),
        Err(KernelError::ThreshError)
    );
    assert_eq!(kernel.thread_preemption_change(owner, 10)?, 25);
    let info = kernel.thread_info(owner)?;
    assert_eq!((info.priority, info.preemption_threshold), (5, 5));

    kernel.semaphore_put(go)?;
    kernel.step();
    let info = kernel.thread_info(owner)?;
    assert_eq!((info.priority, info.preemption_threshold), (25, 10));
    assert_eq!(kernel.mutex_info(mutex)?.owner, Some(blocked));
    Ok(())
}

#[test]
fn block_round_trips_through_waiter() -> Result<(), KernelError> {
    let kernel = kernel();
    let pool = kernel.block_pool_create("blocks", 16, 2)?;
    let allocate = || -> KernelResult<MemoryBlock> {
        kernel
            .block_allocate(pool, Timeout::NoWait)?
            .complete()
            .ok_or(KernelError::NoMemory)
    };
    let first = allocate()?;
    let second = allocate()?;

    let handed = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&handed);
    kernel.thread_create(ThreadConfig::new("w", 5, move |ctx| {
        let k = ctx.kernel();
        let block = match ctx.take_wake() {
            Some(result) => result.ok().and_then(WakePayload::into_block),
            None => match k.block_allocate(pool, Timeout::Forever) {
                Ok(Blocking::Suspended) => return ThreadAction::Continue,
                Ok(Blocking::Complete(block)) => Some(block),
                Err(_) => None,
            },
        };
        if let Some(block) = block {
            let filled = k.with_block(&block, |bytes| {
                bytes.fill(0x5A);
                bytes.len()
            });
            let released = k.block_release(block.clone());
            *seen.lock().unwrap() = Some((block, filled, released));
        }
        ThreadAction::Complete
    }))?;
    kernel.start();
    kernel.run(4);
    assert_eq!(kernel.block_pool_info(pool)?.suspended_count, 1);

    kernel.block_release(first.clone())?;
    kernel.run(4);
    assert_eq!(*handed.lock().unwrap(), Some((first.clone(), Ok(16), Ok(()))));
    assert_eq!(kernel.block_release(first), Err(KernelError::PtrError));

    kernel.block_release(second)?;
    let stats = kernel.block_pool_stats(pool)?;
    assert_eq!((stats.free, stats.used, stats.min_free), (2, 0, 0));
    Ok(())
}

#[test]
fn prioritized_semaphore_waiter_is_served_first() -> Result<(), KernelError> {
    let kernel = kernel();
    let log = Log::default();
    let sem = kernel.semaphore_create("s", 0)?;
    let puts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&puts);
    let notify: SemaphoreNotify = Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    kernel.semaphore_put_notify(sem, Some(notify))?;

    kernel.thread_create(ThreadConfig::new(
        "low",
        10,
        waiter(&log, "low", move |k| payload(k.semaphore_get(sem, Timeout::Forever), |()| WakePayload::None)),
    ))?;
    kernel.start();
    kernel.run(4);
    kernel.thread_create(ThreadConfig::new(
        "high",
        5,
        waiter(&log, "high", move |k| payload(k.semaphore_get(sem, Timeout::Forever), |()| WakePayload::None)),
    ))?;
    kernel.run(4);

    kernel.semaphore_prioritize(sem)?;
    kernel.semaphore_put(sem)?;
    kernel.run(4);
    assert_eq!(entries(&log), vec![("high", Ok(WakePayload::None))]);

    kernel.semaphore_put(sem)?;
    kernel.run(4);
    assert_eq!(entries(&log).len(), 2);
    assert_eq!(puts.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn reset_thread_runs_its_body_again() -> Result<(), KernelError> {
    let kernel = kernel();
    let trail = Trail::default();
    let thread = kernel.thread_create(ThreadConfig::new("t", 5, once(&trail, "t")))?;
    let parked = kernel.thread_create(ThreadConfig::new("p", 6, once(&trail, "p")).auto_start(false))?;
    kernel.start();
    kernel.run(4);
    assert_eq!(kernel.thread_info(thread)?.state, ThreadState::Completed);
    assert_eq!(kernel.thread_reset(parked), Err(KernelError::NotDone));

    kernel.thread_reset(thread)?;
    assert_eq!(kernel.thread_info(thread)?.state, ThreadState::Suspended);
    kernel.thread_resume(thread)?;
    kernel.run(4);
    assert_eq!(*trail.lock().unwrap(), ["t", "t"]);
    Ok(())
}
