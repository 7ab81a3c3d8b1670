//! Compiler options.
//!
//! Every option has a safe default and can be overridden either in code or
//! through `THRIFTJIT_*` environment variables (see [`Options::from_env`]).

use std::str::FromStr;

/// Default cap on how many nested struct levels are inlined into one program.
pub const DEFAULT_MAX_INLINE_DEPTH: usize = 5;
/// Default IR-size budget (in instructions) above which nested structs are deferred.
pub const DEFAULT_MAX_INLINE_SIZE: usize = 50_000;
/// Default depth of the descriptor walk performed by `pretouch`.
pub const DEFAULT_MAX_PRETOUCH_DEPTH: usize = 32;
/// Default runtime nesting cap (traversal frames per call).
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 1024;

/// Which backend runs compiled programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Machine code through the loader. Falls back to the emulator on hosts
    /// without a native backend.
    Native,
    /// The bytecode emulator.
    Interpreter,
}

impl Backend {
    /// Whether this host can run native code.
    pub fn native_available() -> bool {
        cfg!(all(target_arch = "x86_64", unix))
    }

    /// The backend that will actually be used for this request.
    pub fn effective(self) -> Backend {
        match self {
            Backend::Native if Self::native_available() => Backend::Native,
            _ => Backend::Interpreter,
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" | "jit" => Ok(Backend::Native),
            "interp" | "interpreter" | "emulator" => Ok(Backend::Interpreter),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub max_inline_depth: usize,
    pub max_inline_size: usize,
    pub max_pretouch_depth: usize,
    pub max_nesting_depth: usize,
    pub backend: Backend,
    /// Append loaded functions to `/tmp/perf-<pid>.map`.
    pub perf_map: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            max_inline_depth: DEFAULT_MAX_INLINE_DEPTH,
            max_inline_size: DEFAULT_MAX_INLINE_SIZE,
            max_pretouch_depth: DEFAULT_MAX_PRETOUCH_DEPTH,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            backend: Backend::Native,
            perf_map: false,
        }
    }
}

impl Options {
    /// Defaults with `THRIFTJIT_*` environment overrides applied.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up through `get`. Split out from
    /// [`Options::from_env`] so tests don't touch the process environment.
    pub fn with_overrides(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        override_parsed(&get, "THRIFTJIT_MAX_INLINE_DEPTH", &mut self.max_inline_depth);
        override_parsed(&get, "THRIFTJIT_MAX_INLINE_SIZE", &mut self.max_inline_size);
        override_parsed(&get, "THRIFTJIT_MAX_PRETOUCH_DEPTH", &mut self.max_pretouch_depth);
        override_parsed(&get, "THRIFTJIT_MAX_NESTING_DEPTH", &mut self.max_nesting_depth);
        override_parsed(&get, "THRIFTJIT_BACKEND", &mut self.backend);
        if let Some(v) = get("THRIFTJIT_PERF_MAP") {
            self.perf_map = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if self.max_nesting_depth == 0 {
            tracing::warn!("max nesting depth of 0 is unusable, using 1");
            self.max_nesting_depth = 1;
        }
        self
    }

    pub fn max_inline_depth(mut self, depth: usize) -> Self {
        self.max_inline_depth = depth;
        self
    }

    pub fn max_inline_size(mut self, size: usize) -> Self {
        self.max_inline_size = size;
        self
    }

    pub fn max_pretouch_depth(mut self, depth: usize) -> Self {
        self.max_pretouch_depth = depth;
        self
    }

    pub fn max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth.max(1);
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }
}

fn override_parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = get(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => *slot = v,
        Err(e) => tracing::warn!(key, value = %raw, error = %e, "ignoring invalid option override"),
    }
}
