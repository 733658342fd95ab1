use std::process::{Command, Output};

/// Process boundary for the kernel tools.
///
/// Every mutation the agent applies to the kernel is one invocation of
/// `ipset` or `iptables` through this trait; tests substitute a mock or the
/// recording [`FakeRunner`] to assert exact argv sequences.
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<Output>;
}

/// Spawns the real binary and blocks until it exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<Output> {
        Command::new(program).args(args).output()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use self::fake::{FakeRunner, exit_output};

#[cfg(any(test, feature = "test-util"))]
mod fake {
    use std::collections::VecDeque;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use std::sync::Mutex;

    use super::CommandRunner;

    /// Build a process [`Output`] with the given exit code.
    pub fn exit_output(code: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    /// Records every invocation and succeeds unless a scripted response is
    /// queued with [`FakeRunner::push_response`].
    #[derive(Default)]
    pub struct FakeRunner {
        calls: Mutex<Vec<Vec<String>>>,
        responses: Mutex<VecDeque<Output>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue an output for the next invocation; later invocations fall
        /// back to exit 0 once the queue drains.
        pub fn push_response(&self, output: Output) {
            self.responses.lock().unwrap().push_back(output);
        }

        /// Every invocation so far, as `[program, arg…]` vectors.
        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }

        /// Every invocation so far, space-joined for compact assertions.
        pub fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(|argv| argv.join(" ")).collect()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, program: &str, args: &[String]) -> std::io::Result<Output> {
            let mut argv = vec![program.to_string()];
            argv.extend(args.iter().cloned());
            self.calls.lock().unwrap().push(argv);
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| exit_output(0, "", "")))
        }
    }
}
