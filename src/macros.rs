#![allow(unused_macros)]

/// Helper macro for locking items
///
/// ```rust, ignore
///  let mut storage = lock!(self.compiled_classes_lock);
///  storage.insert(class_ref);
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().expect("Failed to acquire lock")
    };
}

/// Helper macro for taking the mutator lock in shared mode
///
/// ```rust, ignore
///  let runtime = read_lock!(self.runtime);
///  let class = runtime.class_linker().lookup_class("Ljava/lang/Object;");
/// ```
macro_rules! read_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.read().expect("Failed to acquire read lock")
    };
}

/// Helper macro for taking the mutator lock in exclusive mode
///
/// ```rust, ignore
///  let mut runtime = write_lock!(self.runtime);
///  runtime.resolve_type(dex_file, type_idx)?;
/// ```
macro_rules! write_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.write().expect("Failed to acquire write lock")
    };
}
