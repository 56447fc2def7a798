//! Producer-consumer over a message queue.
//!
//! The producer runs at a lower priority than the consumer and fills a
//! two-slot queue; it blocks whenever the queue is full and the consumer
//! drains it as messages arrive.

use txk::{Blocking, KernelBuilder, ThreadAction, ThreadConfig, Timeout};

const ITEMS: u32 = 6;

fn main() {
    println!("=== txk producer-consumer ===\n");

    let kernel = KernelBuilder::new().build().expect("valid configuration");
    let queue = kernel.queue_create("work", 1, 2).expect("queue");

    let mut next = 0;
    kernel
        .thread_create(ThreadConfig::new("producer", 10, move |ctx| {
            let kernel = ctx.kernel();
            if let Some(result) = ctx.take_wake() {
                if let Err(err) = result {
                    println!("producer: send failed: {err}");
                    return ThreadAction::Complete;
                }
                println!("producer: sent {next} after waiting");
                next += 1;
            }
            while next < ITEMS {
                match kernel.queue_send(queue, &[next], Timeout::Forever) {
                    Ok(Blocking::Complete(())) => {
                        println!("producer: sent {next}");
                        next += 1;
                    }
                    Ok(Blocking::Suspended) => {
                        println!("producer: queue full, waiting");
                        return ThreadAction::Continue;
                    }
                    Err(err) => {
                        println!("producer: send failed: {err}");
                        return ThreadAction::Complete;
                    }
                }
            }
            ThreadAction::Complete
        }))
        .expect("producer");

    let mut received = 0;
    kernel
        .thread_create(ThreadConfig::new("consumer", 5, move |ctx| {
            let message = match ctx.take_wake() {
                Some(Ok(payload)) => payload.into_message(),
                Some(Err(err)) => {
                    println!("consumer: receive failed: {err}");
                    return ThreadAction::Complete;
                }
                None => match ctx.kernel().queue_receive(queue, Timeout::Forever) {
                    Ok(Blocking::Complete(message)) => Some(message),
                    Ok(Blocking::Suspended) => return ThreadAction::Continue,
                    Err(err) => {
                        println!("consumer: receive failed: {err}");
                        return ThreadAction::Complete;
                    }
                },
            };
            if let Some(message) = message {
                println!("consumer: got {}", message[0]);
                received += 1;
            }
            if received == ITEMS {
                ThreadAction::Complete
            } else {
                ThreadAction::Continue
            }
        }))
        .expect("consumer");

    kernel.start();
    let rounds = kernel.run(1000);

    let info = kernel.queue_info(queue).expect("queue info");
    println!("\nfinished after {rounds} rounds, {} messages left", info.enqueued);
}
