use std::{sync::Arc, thread};

use routelog::{Level, LogFile, RouteHook, Stdout, Tee, WriterMap};

fn main() {
    routelog::init_global().unwrap();
    routelog::set_level(Level::Debug);
    routelog::set_default_writer(Arc::new(Stdout));

    // Billing errors go to a file as well as stdout, the rest of billing to
    // stdout only, with its own plain formatter.
    let path = std::env::temp_dir().join("routelog_billing_errors.log");
    let errors = LogFile::new(&path).expect("Unable to create log file");
    let mut writers = WriterMap::new();
    writers.insert(Level::Error, Arc::new(Tee::stdout_and(Arc::new(errors))));
    let billing_hook = Arc::new(RouteHook::new(writers, Some(routelog::pick_formatter(false))));
    billing_hook.set_default_writer(Arc::new(Stdout));
    let billing = routelog::add("billing", Some(billing_hook));

    log::info!("Hello, world from main thread!");
    billing.with_field("invoice", 1042).info("invoice sent");

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let billing = billing.clone();
            thread::spawn(move || {
                log::debug!(moduleName = "billing", worker = i; "charging card");
                if i == 2 {
                    billing.error(format!("card declined in worker {i}"));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let stored = std::fs::read_to_string(&path).unwrap();
    println!("\n--- {} ---\n{stored}", path.display());
}
