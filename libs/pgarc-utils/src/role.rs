/// Which role the current process is playing.
///
/// Modeled as an explicit value threaded down through component
/// constructors, rather than a process-wide global, and returned by the
/// fork wrapper in `pgarc::jobs` to the child's main entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleContext {
    /// The process that accepted a connection or was invoked directly by an
    /// operator; owns the Worker Registry's launcher slot.
    Launcher,
    /// A process performing one backup/restore/archiving operation, holding
    /// one worker slot in the registry.
    Worker,
    /// A process forked by a worker to run one external helper (e.g. a
    /// piped `gzip`), holding one child sub-slot under its parent's slot.
    WorkerChild,
}

impl RoleContext {
    pub fn is_launcher(self) -> bool {
        matches!(self, RoleContext::Launcher)
    }
}
