use lapq::{Queue, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn send_blocking<T>(q: &Queue<T>, mut value: T) {
    loop {
        match q.try_send(value) {
            Ok(()) => return,
            Err(TrySendError::Full(back)) => {
                value = back;
                std::hint::spin_loop();
            }
            Err(TrySendError::Closed(_)) => panic!("queue closed with work left"),
        }
    }
}

fn main() {
    println!("Work Queue Example\n");

    const NUM_WORKERS: usize = 4;
    const NUM_JOBS: usize = 20;

    let jobs = Arc::new(Queue::<String>::new(128));
    let results = Arc::new(Queue::<String>::new(128));

    let jobs_tx = jobs.clone();
    let producer = thread::spawn(move || {
        for i in 0..NUM_JOBS {
            let job = format!("Job-{:02}", i);
            send_blocking(&jobs_tx, job.clone());
            println!("Enqueued: {}", job);
            thread::sleep(Duration::from_millis(50));
        }
        // Closing the job queue is the workers' signal to drain and exit.
        jobs_tx.close();
        println!("All jobs enqueued!");
    });

    let mut workers = vec![];
    for worker_id in 0..NUM_WORKERS {
        let jobs_rx = jobs.clone();
        let results_tx = results.clone();

        workers.push(thread::spawn(move || {
            let mut processed = 0;
            loop {
                match jobs_rx.try_recv() {
                    Ok(job) => {
                        println!("Worker {} processing: {}", worker_id, job);

                        thread::sleep(Duration::from_millis(200));

                        let result = format!("{} -> completed by worker {}", job, worker_id);
                        send_blocking(&results_tx, result);

                        processed += 1;
                    }
                    Err(_) => {
                        if jobs_rx.is_closed() {
                            break;
                        }
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            }
            println!("Worker {} finished ({} jobs)", worker_id, processed);
        }));
    }

    let results_rx = results.clone();
    let collector = thread::spawn(move || {
        let mut collected = 0;
        while collected < NUM_JOBS {
            match results_rx.try_recv() {
                Ok(result) => {
                    println!("Result: {}", result);
                    collected += 1;
                }
                Err(_) => {
                    std::hint::spin_loop();
                }
            }
        }
        println!("All results collected!");
    });

    producer.join().unwrap();
    for worker in workers {
        worker.join().unwrap();
    }
    collector.join().unwrap();

    println!("\nWork queue example completed!");
}
