//! Reference task set.
//!
//! Compiled into the bundled `procpool-worker` binary and exercised by the
//! demo binaries and the test suite. Applications register their own tasks
//! the same way.

use std::time::Duration;

use crate::runner::{RemoteTask, TaskFailure, TaskRegistry};

/// Build the reference registry.
pub fn registry() -> TaskRegistry {
    let mut reg = TaskRegistry::new();

    reg.register("echo", |s: String| Ok(s));
    reg.register("double", |n: i64| Ok(n * 2));
    reg.register("double-all", |xs: Vec<i64>| {
        Ok(xs.into_iter().map(|n| n * 2).collect::<Vec<i64>>())
    });
    reg.register("sum", |xs: Vec<i64>| Ok(xs.into_iter().sum::<i64>()));
    reg.register("sleep-ms", |ms: u64| {
        std::thread::sleep(Duration::from_millis(ms));
        Ok(ms)
    });
    reg.register("pid", |_: ()| Ok(std::process::id()));
    reg.register("env", |name: String| Ok(std::env::var(name).ok()));
    reg.register("fail", |message: String| -> Result<(), TaskFailure> {
        Err(TaskFailure::with_trace(message, "reference task 'fail'"))
    });
    // Simulates a worker crash: exits without writing a response.
    reg.register("exit", |code: i32| -> Result<(), TaskFailure> {
        std::process::exit(code)
    });
    reg.register_task::<Adder>("adder");

    reg
}

/// Constructor + run shaped task: built from its operands, then summed.
pub struct Adder {
    lhs: i64,
    rhs: i64,
}

impl RemoteTask for Adder {
    type Args = (i64, i64);
    type Output = i64;

    fn new((lhs, rhs): (i64, i64)) -> Result<Self, TaskFailure> {
        Ok(Adder { lhs, rhs })
    }

    fn run(self) -> Result<i64, TaskFailure> {
        Ok(self.lhs + self.rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::proto::TaskTarget;
    use crate::runner::TaskRunner;

    #[test]
    fn test_registry_contains_reference_tasks() {
        let reg = registry();
        for name in ["echo", "double", "double-all", "sum", "sleep-ms", "pid", "env", "fail", "exit", "adder"] {
            assert!(reg.contains(name), "missing task '{name}'");
        }
    }

    #[test]
    fn test_adder_runs() {
        let reg = registry();
        let out = reg
            .run(
                &TaskTarget::Named("adder".to_owned()),
                &codec::to_payload(&(40i64, 2i64)).unwrap(),
            )
            .unwrap();
        assert_eq!(codec::from_payload::<i64>(&out).unwrap(), 42);
    }
}
