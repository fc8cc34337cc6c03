//! Compilation statistics.
//!
//! Every worker of a parallel phase accumulates into its own [`AotCompilationStats`]; the driver
//! merges the per-worker values once the phase completes. The counters never influence
//! compilation, they only feed [`AotCompilationStats::dump`].

use strum::EnumCount;

use crate::runtime::InvokeType;

/// Per-invoke-type counters.
pub type InvokeCounters = [u64; InvokeType::COUNT];

/// Counters collected while resolving, sharpening and compiling.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AotCompilationStats {
    /// Type references known to be resolved in the dex cache at runtime
    pub types_in_dex_cache: u64,
    /// Type references that need a runtime resolution check
    pub types_not_in_dex_cache: u64,
    /// String references known to be resolved in the dex cache at runtime
    pub strings_in_dex_cache: u64,
    /// String references that need a runtime resolution check
    pub strings_not_in_dex_cache: u64,
    /// Instance field accesses resolved on the fast path
    pub resolved_instance_fields: u64,
    /// Instance field accesses left to the slow path
    pub unresolved_instance_fields: u64,
    /// Static field accesses to the referrer's own class
    pub resolved_local_static_fields: u64,
    /// Static field accesses to other classes resolved on the fast path
    pub resolved_static_fields: u64,
    /// Static field accesses left to the slow path
    pub unresolved_static_fields: u64,
    /// Static accesses that need no class initialization check
    pub class_init_checks_elided: u64,
    /// Invokes resolved at compile time
    pub resolved_methods: InvokeCounters,
    /// Invokes left to the runtime
    pub unresolved_methods: InvokeCounters,
    /// Dispatching invokes turned into direct calls because the target is final
    pub virtual_made_direct: InvokeCounters,
    /// Dispatching invokes turned into direct calls by verifier type facts
    pub type_based_devirtualization: u64,
    /// Direct calls whose code lives in the boot image
    pub direct_calls_to_boot: InvokeCounters,
    /// Direct calls whose method record lives in the boot image
    pub direct_methods_to_boot: InvokeCounters,
    /// `check-cast` instructions proven safe
    pub safe_casts: u64,
    /// `check-cast` instructions that must stay
    pub not_safe_casts: u64,
    /// Instance field instructions quickened to offsets
    pub quickened_field_accesses: u64,
    /// Virtual invokes quickened to vtable indices
    pub quickened_invokes: u64,
    /// `return-void` instructions freed of the constructor barrier
    pub constructor_barriers_elided: u64,
    /// Methods compiled to native code
    pub native_methods_compiled: u64,
    /// Native methods compiled to JNI stubs
    pub jni_stubs_compiled: u64,
    /// Methods given a dex-to-dex result
    pub dex_to_dex_methods: u64,
}

fn percentage(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    {
        hits as f64 * 100.0 / total as f64
    }
}

fn add_counters(into: &mut InvokeCounters, from: &InvokeCounters) {
    for (a, b) in into.iter_mut().zip(from) {
        *a += b;
    }
}

impl AotCompilationStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a resolved invoke of kind `invoke_type`.
    pub fn resolved_method(&mut self, invoke_type: InvokeType) {
        self.resolved_methods[invoke_type as usize] += 1;
    }

    /// Records an unresolved invoke of kind `invoke_type`.
    pub fn unresolved_method(&mut self, invoke_type: InvokeType) {
        self.unresolved_methods[invoke_type as usize] += 1;
    }

    /// Records a dispatching invoke of kind `invoke_type` made direct.
    pub fn virtual_made_direct(&mut self, invoke_type: InvokeType) {
        self.virtual_made_direct[invoke_type as usize] += 1;
    }

    /// Records which parts of a direct call of kind `invoke_type` point into the boot image.
    pub fn direct_call_to_boot(&mut self, invoke_type: InvokeType, code: bool, method: bool) {
        if code {
            self.direct_calls_to_boot[invoke_type as usize] += 1;
        }
        if method {
            self.direct_methods_to_boot[invoke_type as usize] += 1;
        }
    }

    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &AotCompilationStats) {
        self.types_in_dex_cache += other.types_in_dex_cache;
        self.types_not_in_dex_cache += other.types_not_in_dex_cache;
        self.strings_in_dex_cache += other.strings_in_dex_cache;
        self.strings_not_in_dex_cache += other.strings_not_in_dex_cache;
        self.resolved_instance_fields += other.resolved_instance_fields;
        self.unresolved_instance_fields += other.unresolved_instance_fields;
        self.resolved_local_static_fields += other.resolved_local_static_fields;
        self.resolved_static_fields += other.resolved_static_fields;
        self.unresolved_static_fields += other.unresolved_static_fields;
        self.class_init_checks_elided += other.class_init_checks_elided;
        add_counters(&mut self.resolved_methods, &other.resolved_methods);
        add_counters(&mut self.unresolved_methods, &other.unresolved_methods);
        add_counters(&mut self.virtual_made_direct, &other.virtual_made_direct);
        self.type_based_devirtualization += other.type_based_devirtualization;
        add_counters(&mut self.direct_calls_to_boot, &other.direct_calls_to_boot);
        add_counters(&mut self.direct_methods_to_boot, &other.direct_methods_to_boot);
        self.safe_casts += other.safe_casts;
        self.not_safe_casts += other.not_safe_casts;
        self.quickened_field_accesses += other.quickened_field_accesses;
        self.quickened_invokes += other.quickened_invokes;
        self.constructor_barriers_elided += other.constructor_barriers_elided;
        self.native_methods_compiled += other.native_methods_compiled;
        self.jni_stubs_compiled += other.jni_stubs_compiled;
        self.dex_to_dex_methods += other.dex_to_dex_methods;
    }

    /// Logs the counters and hit rates.
    pub fn dump(&self) {
        log::info!(
            "types in dex cache: {} / {} ({:.2}%)",
            self.types_in_dex_cache,
            self.types_in_dex_cache + self.types_not_in_dex_cache,
            percentage(self.types_in_dex_cache, self.types_not_in_dex_cache)
        );
        log::info!(
            "strings in dex cache: {} / {} ({:.2}%)",
            self.strings_in_dex_cache,
            self.strings_in_dex_cache + self.strings_not_in_dex_cache,
            percentage(self.strings_in_dex_cache, self.strings_not_in_dex_cache)
        );
        log::info!(
            "fast instance fields: {:.2}%, fast static fields: {:.2}% ({} local, {} class init checks elided)",
            percentage(self.resolved_instance_fields, self.unresolved_instance_fields),
            percentage(
                self.resolved_static_fields + self.resolved_local_static_fields,
                self.unresolved_static_fields
            ),
            self.resolved_local_static_fields,
            self.class_init_checks_elided
        );
        for invoke_type in <InvokeType as strum::IntoEnumIterator>::iter() {
            let i = invoke_type as usize;
            log::info!(
                "{invoke_type:?} invokes: {:.2}% resolved, {} made direct, {} calls / {} methods to boot",
                percentage(self.resolved_methods[i], self.unresolved_methods[i]),
                self.virtual_made_direct[i],
                self.direct_calls_to_boot[i],
                self.direct_methods_to_boot[i]
            );
        }
        log::info!(
            "type based devirtualization: {}, safe casts: {:.2}%",
            self.type_based_devirtualization,
            percentage(self.safe_casts, self.not_safe_casts)
        );
        log::info!(
            "quickened: {} field accesses, {} invokes, {} barriers elided",
            self.quickened_field_accesses,
            self.quickened_invokes,
            self.constructor_barriers_elided
        );
        log::info!(
            "compiled: {} native, {} jni, {} dex-to-dex",
            self.native_methods_compiled,
            self.jni_stubs_compiled,
            self.dex_to_dex_methods
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_adds_every_counter() {
        let mut a = AotCompilationStats::new();
        a.safe_casts = 2;
        a.resolved_method(InvokeType::Virtual);

        let mut b = AotCompilationStats::new();
        b.safe_casts = 3;
        b.not_safe_casts = 1;
        b.resolved_method(InvokeType::Virtual);
        b.direct_call_to_boot(InvokeType::Static, true, false);

        a.merge(&b);
        assert_eq!(a.safe_casts, 5);
        assert_eq!(a.not_safe_casts, 1);
        assert_eq!(a.resolved_methods[InvokeType::Virtual as usize], 2);
        assert_eq!(a.direct_calls_to_boot[InvokeType::Static as usize], 1);
        assert_eq!(a.direct_methods_to_boot[InvokeType::Static as usize], 0);
    }

    #[test]
    fn test_percentage() {
        assert!((percentage(1, 3) - 25.0).abs() < f64::EPSILON);
        assert!(percentage(0, 0).abs() < f64::EPSILON);
    }
}
