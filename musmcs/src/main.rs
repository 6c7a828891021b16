use std::process::exit;

use musmcs::cli::{parse_args, run};

fn main() {
    // Terminate the process if a worker thread panics.
    // take_hook() returns the default hook in case when a custom one is not set
    let orig_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        // invoke the default handler and exit the process
        orig_hook(panic_info);
        exit(1);
    }));

    let args = parse_args();
    match run(&args) {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            exit(1);
        }
    }
}
