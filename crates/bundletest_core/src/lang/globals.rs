//! Host globals the sandbox exposes to emitted programs.
//!
//! ## Notes
//! - `always` globals are injected into every sandbox; the others depend on case configuration
//!   (`document` only exists for html document types).
//! - Fixture-facing await points (`NEXT_HMR`, `NEXT_REBUILD`) are flagged so diagnostics can point at them.

/// Stable identifier for host globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostGlobalId {
    Expect,
    SetTimeout,
    Console,
    Require,
    State,
    NextHmr,
    NextRebuild,
    WatchStep,
    Document,
}

/// Metadata for a host global.
#[derive(Debug, Clone, Copy)]
pub struct HostGlobalInfo {
    pub id: HostGlobalId,
    pub name: &'static str,
    pub always: bool,
    /// Whether calling the global yields an update promise fixture code awaits.
    pub await_point: bool,
    pub description: &'static str,
}

/// Registry of all host globals.
pub const HOST_GLOBALS: &[HostGlobalInfo] = &[
    g(
        HostGlobalId::Expect,
        "expect",
        true,
        false,
        "Assertion entry point; returns a matcher object",
    ),
    g(
        HostGlobalId::SetTimeout,
        "setTimeout",
        true,
        false,
        "Schedules a callback on the sandbox's virtual clock",
    ),
    g(
        HostGlobalId::Console,
        "console",
        true,
        false,
        "log/warn/error forwarded to the harness log",
    ),
    g(
        HostGlobalId::Require,
        "require",
        true,
        false,
        "Synchronous module import against the live registry",
    ),
    g(
        HostGlobalId::State,
        "STATE",
        true,
        false,
        "Object that survives reloads for the lifetime of the sandbox",
    ),
    g(
        HostGlobalId::NextHmr,
        "NEXT_HMR",
        true,
        true,
        "Requests the next hot update; `{ expectError: true }` captures failures",
    ),
    g(
        HostGlobalId::NextRebuild,
        "NEXT_REBUILD",
        true,
        true,
        "Requests the next watch rebuild",
    ),
    g(
        HostGlobalId::WatchStep,
        "WATCH_STEP",
        true,
        false,
        "Index of the step currently executing",
    ),
    g(
        HostGlobalId::Document,
        "document",
        false,
        false,
        "Minimal DOM for html document types",
    ),
];

/// Full metadata.
///
/// ## Panics
/// - If the registry is missing an entry for `id` (this indicates a programming error).
pub fn info_for(id: HostGlobalId) -> &'static HostGlobalInfo {
    HOST_GLOBALS
        .iter()
        .find(|g| g.id == id)
        .expect("host global info missing")
}

/// Name the global is bound under.
pub fn as_str(id: HostGlobalId) -> &'static str {
    info_for(id).name
}

/// Lookup by bound name.
pub fn from_str(name: &str) -> Option<HostGlobalId> {
    HOST_GLOBALS.iter().find(|g| g.name == name).map(|g| g.id)
}

/// Globals injected into every sandbox.
pub fn always() -> impl Iterator<Item = HostGlobalId> {
    HOST_GLOBALS.iter().filter(|g| g.always).map(|g| g.id)
}

const fn g(
    id: HostGlobalId,
    name: &'static str,
    always: bool,
    await_point: bool,
    description: &'static str,
) -> HostGlobalInfo {
    HostGlobalInfo {
        id,
        name,
        always,
        await_point,
        description,
    }
}
