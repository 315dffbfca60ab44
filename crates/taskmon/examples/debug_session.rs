//! Simulated debug session
//!
//! Reads target memory through a range cache, combines two register caches in a
//! transaction and runs a launch sequence built from a step catalog, with one
//! variant that fails and rolls back.
//!
//! Run with `RUST_LOG=taskmon=debug` to see the dispatcher at work.

use std::sync::Arc;
use std::time::Duration;

use taskmon::{
    codes, Cache, DataRequestMonitor, DefaultDispatcher, Dispatcher, DispatcherConfig, DispatcherRef, FnStep,
    Query, RangeCache, RequestCache, RequestMonitor, Status, StepCatalog, StepContext, TracingReporter,
    TxContext, TxResult,
};
use tracing_subscriber::EnvFilter;

const TARGET_LATENCY: Duration = Duration::from_millis(20);

/// Complete `rm` with `value` after the simulated target latency
fn reply_later<V: Send + 'static>(dispatcher: &DispatcherRef, rm: DataRequestMonitor<V>, value: V) {
    let failed = rm.clone();
    if let Err(err) = dispatcher.schedule(Box::new(move || rm.done_with(value)), TARGET_LATENCY) {
        failed.set_status(Status::error(codes::REQUEST_FAILED, err.to_string()));
        failed.done();
    }
}

fn register(dispatcher: &DispatcherRef, name: &str, value: u64) -> RequestCache<u64> {
    let target = dispatcher.clone();
    RequestCache::named(name, dispatcher, move |rm: DataRequestMonitor<u64>| {
        reply_later(&target, rm, value)
    })
}

fn launch_catalog() -> StepCatalog {
    let step = |name: &'static str| {
        FnStep::new(name, move |ctx: &StepContext, rm: RequestMonitor| {
            println!("  [{}] {}", ctx.index(), name);
            let failed = rm.clone();
            if let Err(err) = ctx.dispatcher().schedule(Box::new(move || rm.done()), TARGET_LATENCY) {
                failed.set_status(Status::error(codes::REQUEST_FAILED, err.to_string()));
                failed.done();
            }
        })
        .with_roll_back(move |_: &StepContext, rm: RequestMonitor| {
            println!("  undo {}", name);
            rm.done();
        })
    };

    let mut catalog = StepCatalog::new();
    let built = catalog
        .add_step("load image", step("load image"))
        .and_then(|c| c.add_step("start process", step("start process")))
        .and_then(|c| c.add_step("attach", step("attach")))
        .and_then(|c| c.add_step("resume", step("resume")))
        .and_then(|c| c.add_group("prepare", ["load image", "start process"]))
        .and_then(|c| c.add_group("launch", ["prepare", "attach", "resume"]));
    if let Err(err) = built {
        eprintln!("catalog error: {}", err);
    }
    catalog
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Simulated debug session ===\n");

    let config = DispatcherConfig::new().with_thread_name("session")?;
    let raw = DefaultDispatcher::new(config)?;
    let dispatcher: DispatcherRef = raw.clone();

    // Memory
    let image: Arc<Vec<u8>> = Arc::new((0..=255).collect());
    let target = dispatcher.clone();
    let memory = RangeCache::named("memory", &dispatcher, move |offset, count, rm: DataRequestMonitor<Vec<u8>>| {
        println!("  target read {}..{}", offset, offset + count);
        reply_later(&target, rm, image[offset..offset + count].to_vec());
    });

    for (offset, count) in [(0, 16), (8, 16), (0, 32)] {
        let range = memory.clone();
        let query = Query::new(move |rm: DataRequestMonitor<Vec<u8>>| range.get_range(offset, count).request(rm));
        query.submit(&dispatcher)?;
        let bytes = query.get_timeout(Duration::from_secs(5))?;
        println!("memory[{}..{}] = {:02x?}", offset, offset + count, bytes);
    }

    // Registers
    let pc = register(&dispatcher, "pc", 0x4000);
    let offset = register(&dispatcher, "offset", 0x20);
    let tx_dispatcher = dispatcher.clone();
    let query = Query::new(move |rm: DataRequestMonitor<u64>| {
        taskmon::transaction::request(
            &tx_dispatcher,
            move |tx: &mut TxContext| -> TxResult<u64> {
                tx.validate(&[&pc, &offset])?;
                Ok(pc.data().unwrap_or_default() + offset.data().unwrap_or_default())
            },
            rm,
        )
    });
    query.submit(&dispatcher)?;
    println!("\nbreakpoint address = {:#x}\n", query.get()?);

    // Launch
    println!("Launching:");
    let handle = launch_catalog()
        .into_sequence(&dispatcher, "launch")?
        .with_reporter(TracingReporter::new())
        .start()?;
    println!("launch finished: {:?}\n", handle.get()?.severity());

    println!("Launching with a failing attach:");
    let mut catalog = launch_catalog();
    catalog.override_step(
        "attach",
        FnStep::new("attach", |_: &StepContext, rm: RequestMonitor| {
            rm.set_status(Status::error(codes::TARGET_ERROR, "attach refused"));
            rm.done();
        }),
    )?;
    let handle = catalog.into_sequence(&dispatcher, "launch")?.start()?;
    match handle.get() {
        Ok(status) => println!("unexpected success: {}", status),
        Err(err) => println!("launch failed as expected: {}", err),
    }

    let stats = raw.stats();
    println!(
        "\ndispatcher ran {} jobs ({} scheduled, {} slow)",
        stats.executed_jobs, stats.scheduled_jobs, stats.slow_jobs
    );
    raw.shutdown();
    Ok(())
}
