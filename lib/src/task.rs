//! Task-context services.
//!
//! The core needs four things from whatever is running it: an identity for
//! the current task (transmit-lock ownership, credentials), a pending-signal
//! probe (interruptible waits), a way to raise SIGPIPE, and a way to relax
//! while spinning. All four are registrable hooks with inert defaults so
//! the crate works unhosted.

use spin::RwLock;

/// The pluggable task services.
#[derive(Clone, Copy)]
pub struct TaskHooks {
    /// Identity of the calling task. Distinct concurrent callers must get
    /// distinct values; the default claims everyone is task 0.
    pub current_task_id: fn() -> u64,
    /// Whether a signal is pending for the calling task.
    pub signal_pending: fn() -> bool,
    /// Raise SIGPIPE against the calling task.
    pub send_sigpipe: fn(),
    /// Called in wait loops between condition checks.
    pub relax: fn(),
}

fn default_task_id() -> u64 {
    0
}

fn default_signal_pending() -> bool {
    false
}

fn default_send_sigpipe() {}

fn default_relax() {
    core::hint::spin_loop();
}

static HOOKS: RwLock<TaskHooks> = RwLock::new(TaskHooks {
    current_task_id: default_task_id,
    signal_pending: default_signal_pending,
    send_sigpipe: default_send_sigpipe,
    relax: default_relax,
});

/// Install the embedder's task services. Later installs win entirely.
pub fn register_hooks(hooks: TaskHooks) {
    *HOOKS.write() = hooks;
}

/// Hooks with the built-in defaults, for partial overrides.
pub const fn default_hooks() -> TaskHooks {
    TaskHooks {
        current_task_id: default_task_id,
        signal_pending: default_signal_pending,
        send_sigpipe: default_send_sigpipe,
        relax: default_relax,
    }
}

/// Identity of the calling task.
#[inline]
pub fn current_task_id() -> u64 {
    (HOOKS.read().current_task_id)()
}

/// Whether a signal is pending for the calling task.
#[inline]
pub fn signal_pending() -> bool {
    (HOOKS.read().signal_pending)()
}

/// Raise SIGPIPE against the calling task.
#[inline]
pub fn send_sigpipe() {
    (HOOKS.read().send_sigpipe)()
}

/// Relax the CPU inside a wait loop.
#[inline]
pub fn relax() {
    (HOOKS.read().relax)()
}
