use criterion::{black_box, criterion_group, criterion_main, Criterion};
use probejob_core::{Dispatcher, DispatcherConfig, ExecutionMutex, Job, MockDriver, Progress, DEFAULT_LOCK_TIMEOUT};

fn bench_execute_complete(c: &mut Criterion) {
    let mutex = ExecutionMutex::new(MockDriver::new(), DEFAULT_LOCK_TIMEOUT);
    let progress = Progress::disabled("read");
    c.bench_function("execute_complete_read", |b| {
        b.iter(|| {
            let job = Job::read(0x2000_0000, 64).unwrap();
            let _ = black_box(job.execute(&mutex, &progress).complete());
        })
    });
}

fn bench_dispatch_throughput(c: &mut Criterion) {
    let mut dispatcher = Dispatcher::new(MockDriver::new(), DispatcherConfig::default());
    c.bench_function("dispatch_64_reads", |b| {
        b.iter(|| {
            for _ in 0..64 {
                dispatcher.submit(Job::read(0x2000_0000, 64).unwrap(), |r| {
                    let _ = black_box(r);
                });
            }
            dispatcher.run_until_idle();
        })
    });
}

criterion_group!(benches, bench_execute_complete, bench_dispatch_throughput);
criterion_main!(benches);
