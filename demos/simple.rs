//! Simple usage example

use lapq::{Queue, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread;

fn main() {
    println!("lapq - Simple Example\n");

    // Create a queue with 16 slots
    let queue = Arc::new(Queue::<String>::new(16));

    // Clone handles for different threads
    let producer_queue = queue.clone();
    let consumer_queue = queue.clone();

    // Producer thread
    let producer = thread::spawn(move || {
        for i in 0..10 {
            let mut message = format!("Message {}", i);
            println!("Sending: {}", message);

            loop {
                match producer_queue.try_send(message) {
                    Ok(()) => break,
                    Err(TrySendError::Full(back)) => {
                        // Queue is full, spin and retry
                        message = back;
                        std::hint::spin_loop();
                    }
                    Err(TrySendError::Closed(_)) => return,
                }
            }

            // Small delay to make output readable
            thread::sleep(std::time::Duration::from_millis(100));
        }
        // No more messages coming; let the consumer drain and exit.
        producer_queue.close();
        println!("Producer finished!");
    });

    // Consumer thread
    let consumer = thread::spawn(move || {
        loop {
            match consumer_queue.try_recv() {
                Ok(message) => println!("Received: {}", message),
                Err(TryRecvError) => {
                    if consumer_queue.is_closed() {
                        break;
                    }
                    // Queue is empty, spin and retry
                    std::hint::spin_loop();
                }
            }
        }
        println!("Consumer finished!");
    });

    // Wait for both threads to complete
    producer.join().unwrap();
    consumer.join().unwrap();

    println!("\nExample completed successfully!");
}
