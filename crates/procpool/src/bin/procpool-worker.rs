//! Standalone worker serving the reference task set.
//!
//! Reads request frames on stdin, writes response frames on stdout, exits
//! on EOF. Point a pool at it with
//! `WorkerCommand::new("path/to/procpool-worker")`.

fn main() {
    let registry = procpool::tasks::registry();
    std::process::exit(procpool::run_worker(&registry, &procpool::Bincode));
}
