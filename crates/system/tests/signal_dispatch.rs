//! Dispatcher loop behaviour against scripted hooks

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use stratum_system::signal::{
    AttachMechanism, AttachState, AttachStateCell, BREAK_SIGNAL, DiagnosticHooks, DispatcherState,
    HookResult, PendingSignals, SignalChannel, SignalConfig, SignalDispatcher, SignalThread,
    SignalUpcall,
};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    fail_threads: bool,
    panic_threads: bool,
    data_dump: bool,
}

impl Recorder {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl DiagnosticHooks for Recorder {
    fn print_threads(&self, locks: bool) -> HookResult {
        self.push(format!("threads(locks={locks})"));
        if self.fail_threads {
            return Err("thread dump failed".into());
        }
        assert!(!self.panic_threads, "thread list corrupted");
        Ok(())
    }

    fn find_deadlocks(&self) -> HookResult {
        self.push("deadlocks");
        Ok(())
    }

    fn print_heap(&self) -> HookResult {
        self.push("heap");
        Ok(())
    }

    fn print_class_histogram(&self) -> HookResult {
        self.push("histogram");
        Ok(())
    }

    fn should_post_data_dump(&self) -> bool {
        self.data_dump
    }

    fn post_data_dump(&self) -> HookResult {
        self.push("data_dump");
        Ok(())
    }
}

impl SignalUpcall for Recorder {
    fn dispatch(&self, sig: i32) -> HookResult {
        self.push(format!("upcall({sig})"));
        if sig == libc::SIGUSR1 {
            return Err("handler threw".into());
        }
        assert_ne!(sig, libc::SIGHUP, "handler blew up");
        Ok(())
    }
}

struct ScriptedAttach {
    cell: AttachStateCell,
    trigger: AtomicBool,
}

impl ScriptedAttach {
    fn new(trigger: bool) -> Arc<Self> {
        Arc::new(Self {
            cell: AttachStateCell::new(),
            trigger: AtomicBool::new(trigger),
        })
    }
}

impl AttachMechanism for ScriptedAttach {
    fn state(&self) -> &AttachStateCell {
        &self.cell
    }

    fn is_init_trigger(&self) -> bool {
        let triggered = self.trigger.load(Ordering::SeqCst);
        if triggered {
            self.cell.set(AttachState::Initialized);
        }
        triggered
    }

    fn check_socket_file(&self) -> bool {
        false
    }
}

fn eventually(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn start(
    recorder: &Arc<Recorder>,
    config: SignalConfig,
    attach: Option<Arc<ScriptedAttach>>,
) -> (Arc<PendingSignals>, SignalThread) {
    let _ = stratum_log::init_test();
    let channel = Arc::new(PendingSignals::new());
    let mut dispatcher =
        SignalDispatcher::new(channel.clone(), recorder.clone(), recorder.clone()).with_config(config);
    if let Some(attach) = attach {
        dispatcher = dispatcher.with_attach(attach);
    }
    let thread = dispatcher.start().unwrap().expect("thread started");
    (channel, thread)
}

#[test]
fn break_signal_runs_diagnostics_in_order() {
    let recorder = Arc::new(Recorder {
        data_dump: true,
        ..Recorder::default()
    });
    let config = SignalConfig {
        print_class_histogram: true,
        print_concurrent_locks: true,
        ..SignalConfig::default()
    };
    let (channel, thread) = start(&recorder, config, None);

    channel.notify(BREAK_SIGNAL);
    eventually(|| recorder.events().len() >= 5);
    thread.terminate().unwrap();

    assert_eq!(
        recorder.events(),
        ["threads(locks=true)", "deadlocks", "heap", "histogram", "data_dump"]
    );
}

#[test]
fn failing_step_does_not_stop_the_sequence() {
    let recorder = Arc::new(Recorder {
        fail_threads: true,
        ..Recorder::default()
    });
    let (channel, thread) = start(&recorder, SignalConfig::default(), None);

    channel.notify(BREAK_SIGNAL);
    eventually(|| recorder.events().len() >= 3);
    thread.terminate().unwrap();

    assert_eq!(recorder.events(), ["threads(locks=false)", "deadlocks", "heap"]);
}

#[test]
fn upcall_failure_keeps_loop_alive() {
    let recorder = Arc::new(Recorder::default());
    let (channel, thread) = start(&recorder, SignalConfig::default(), None);

    channel.notify(libc::SIGUSR1);
    eventually(|| recorder.events().len() >= 1);
    channel.notify(libc::SIGUSR2);
    eventually(|| recorder.events().len() >= 2);

    assert_ne!(thread.state(), DispatcherState::Terminated);
    thread.terminate().unwrap();
    assert_eq!(
        recorder.events(),
        [format!("upcall({})", libc::SIGUSR1), format!("upcall({})", libc::SIGUSR2)]
    );
}

#[test]
fn panicking_upcall_keeps_loop_alive() {
    let recorder = Arc::new(Recorder::default());
    let (channel, thread) = start(&recorder, SignalConfig::default(), None);

    channel.notify(libc::SIGHUP);
    eventually(|| recorder.events().len() >= 1);
    channel.notify(BREAK_SIGNAL);
    eventually(|| recorder.events().len() >= 4);

    assert_ne!(thread.state(), DispatcherState::Terminated);
    thread.terminate().unwrap();
    assert_eq!(
        recorder.events(),
        [format!("upcall({})", libc::SIGHUP), "threads(locks=false)".into(), "deadlocks".into(), "heap".into()]
    );
}

#[test]
fn panicking_step_does_not_stop_the_sequence() {
    let recorder = Arc::new(Recorder {
        panic_threads: true,
        ..Recorder::default()
    });
    let (channel, thread) = start(&recorder, SignalConfig::default(), None);

    channel.notify(BREAK_SIGNAL);
    eventually(|| recorder.events().len() >= 3);
    channel.notify(libc::SIGUSR2);
    eventually(|| recorder.events().len() >= 4);
    thread.terminate().unwrap();

    assert_eq!(
        recorder.events(),
        [
            "threads(locks=false)".to_owned(),
            "deadlocks".into(),
            "heap".into(),
            format!("upcall({})", libc::SIGUSR2)
        ]
    );
}

#[test]
fn attach_request_consumes_break_signal() {
    let recorder = Arc::new(Recorder::default());
    let attach = ScriptedAttach::new(true);
    let (channel, thread) = start(&recorder, SignalConfig::default(), Some(attach.clone()));

    // The first break starts the listener and is swallowed.
    channel.notify(BREAK_SIGNAL);
    eventually(|| attach.cell.get() == AttachState::Initialized);

    // With the listener healthy the next break is a plain dump.
    channel.notify(BREAK_SIGNAL);
    eventually(|| recorder.events().len() >= 3);
    thread.terminate().unwrap();

    assert_eq!(recorder.events(), ["threads(locks=false)", "deadlocks", "heap"]);
}

#[test]
fn attach_without_trigger_resets_state_and_dumps() {
    let recorder = Arc::new(Recorder::default());
    let attach = ScriptedAttach::new(false);
    let (channel, thread) = start(&recorder, SignalConfig::default(), Some(attach.clone()));

    channel.notify(BREAK_SIGNAL);
    eventually(|| recorder.events().len() >= 3);
    thread.terminate().unwrap();

    assert_eq!(attach.cell.get(), AttachState::NotInitialized);
}

#[test]
fn concurrent_initializer_swallows_break() {
    let recorder = Arc::new(Recorder::default());
    let attach = ScriptedAttach::new(false);
    attach.cell.set(AttachState::Initializing);
    let (channel, thread) = start(&recorder, SignalConfig::default(), Some(attach.clone()));

    channel.notify(BREAK_SIGNAL);
    channel.notify(libc::SIGUSR2);
    eventually(|| !recorder.events().is_empty());
    thread.terminate().unwrap();

    // SIGQUIT is taken before SIGUSR2, yet only the upcall produced output.
    assert_eq!(recorder.events(), [format!("upcall({})", libc::SIGUSR2)]);
    assert_eq!(attach.cell.get(), AttachState::Initializing);
}

#[test]
fn disabled_attach_mechanism_is_never_consulted() {
    let recorder = Arc::new(Recorder::default());
    let attach = ScriptedAttach::new(true);
    let config = SignalConfig {
        disable_attach_mechanism: true,
        ..SignalConfig::default()
    };
    let (channel, thread) = start(&recorder, config, Some(attach.clone()));

    channel.notify(BREAK_SIGNAL);
    eventually(|| recorder.events().len() >= 3);
    thread.terminate().unwrap();

    assert_eq!(attach.cell.get(), AttachState::NotInitialized);
}

#[test]
fn terminate_ends_the_thread() {
    let recorder = Arc::new(Recorder::default());
    let (_channel, thread) = start(&recorder, SignalConfig::default(), None);
    thread.terminate().unwrap();
    assert!(recorder.events().is_empty());
}

#[test]
fn reduced_signal_usage_spawns_nothing() {
    let recorder = Arc::new(Recorder::default());
    let config = SignalConfig {
        reduce_signal_usage: true,
        ..SignalConfig::default()
    };
    let started = SignalDispatcher::new(Arc::new(PendingSignals::new()), recorder.clone(), recorder)
        .with_config(config)
        .start()
        .unwrap();
    assert!(started.is_none());
}
