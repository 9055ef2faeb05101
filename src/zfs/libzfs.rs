//! The libzfs-backed adapter: the production implementation of [`Adapter`].
//!
//! Thin wrappers over raw handles keep the FFI surface contained; every
//! failure is surfaced through `libzfs_errno`/`libzfs_error_description`
//! with the dataset identifier attached.

use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_int};
use std::ptr;

use super::dataset::is_snapshot_name;
use super::{
    Adapter, AdapterError, CANMOUNT_PROP, CREATION_PROP, MOUNTED_PROP, MOUNTPOINT_PROP,
    ORIGIN_PROP, RawProperty, validation,
};

const PROP_BUF_SIZE: usize = 1024;

/// ZFS adapter backed by libzfs.
pub struct LibZfsAdapter {
    lzh: LibHandle,
}

// The adapter holds raw libzfs handles and is not safe to share; the engine
// serializes every call behind its mutex, which makes moving it across
// threads sound.
unsafe impl Send for LibZfsAdapter {}

impl LibZfsAdapter {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(LibZfsAdapter {
            lzh: LibHandle::new()?,
        })
    }

    fn open(&self, name: &str, types: c_int) -> Result<DatasetHandle, AdapterError> {
        // Names go straight to the FFI layer, so check them end-to-end
        // rather than trusting the caller.
        validation::validate_dataset_name(name)
            .map_err(|err| AdapterError::new(name, err.to_string()))?;
        let cname = cstring(name)?;
        let handle = unsafe { ffi::zfs_open(self.lzh.handle, cname.as_ptr(), types) };
        if handle.is_null() {
            return Err(self.lzh.error(name));
        }
        Ok(DatasetHandle {
            handle,
            owns_handle: true,
        })
    }

    fn open_any(&self, name: &str) -> Result<DatasetHandle, AdapterError> {
        let types = if is_snapshot_name(name) {
            ffi::ZFS_TYPE_SNAPSHOT
        } else {
            ffi::ZFS_TYPE_FILESYSTEM
        };
        self.open(name, types)
    }

    fn child_filesystem_names(&self, handle: &DatasetHandle) -> Result<Vec<String>, AdapterError> {
        let mut names = NameCollector::default();
        let result = unsafe {
            ffi::zfs_iter_filesystems(
                handle.handle,
                NameCollector::callback,
                names.as_mut_ptr(),
            )
        };
        if result != 0 {
            return Err(self.lzh.error(&handle.name().unwrap_or_default()));
        }
        Ok(names.names)
    }

    fn snapshot_names(&self, handle: &DatasetHandle) -> Result<Vec<String>, AdapterError> {
        let mut names = NameCollector::default();
        let result = unsafe {
            ffi::zfs_iter_snapshots(
                handle.handle,
                0,
                NameCollector::callback,
                names.as_mut_ptr(),
                0,
                u64::MAX,
            )
        };
        if result != 0 {
            return Err(self.lzh.error(&handle.name().unwrap_or_default()));
        }
        Ok(names.names)
    }

    fn collect_children(
        &self,
        name: &str,
        recursive: bool,
        out: &mut Vec<String>,
    ) -> Result<(), AdapterError> {
        let handle = self.open(name, ffi::ZFS_TYPE_FILESYSTEM)?;
        out.extend(self.snapshot_names(&handle)?);
        for child in self.child_filesystem_names(&handle)? {
            out.push(child.clone());
            if recursive {
                self.collect_children(&child, true, out)?;
            }
        }
        Ok(())
    }

    /// Read one native string property together with its source tag.
    fn string_prop(&self, handle: &DatasetHandle, prop: c_int) -> Option<RawProperty> {
        let mut buf = vec![0u8; PROP_BUF_SIZE];
        let mut statbuf = vec![0u8; PROP_BUF_SIZE];
        let mut srctype: c_int = 0;
        let result = unsafe {
            ffi::zfs_prop_get(
                handle.handle,
                prop,
                buf.as_mut_ptr() as *mut c_char,
                PROP_BUF_SIZE,
                &mut srctype,
                statbuf.as_mut_ptr() as *mut c_char,
                PROP_BUF_SIZE,
                1,
            )
        };
        if result != 0 {
            return None;
        }
        let value = truncate_at_nul(buf)?;
        let origin = truncate_at_nul(statbuf).unwrap_or_default();
        Some(RawProperty::new(value, source_tag(srctype, &origin)))
    }

    fn numeric_prop(&self, handle: &DatasetHandle, prop: c_int) -> Option<u64> {
        let mut value: u64 = 0;
        let result = unsafe {
            ffi::zfs_prop_get_numeric(
                handle.handle,
                prop,
                &mut value as *mut u64,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        if result == 0 { Some(value) } else { None }
    }

    /// Read every user property from the handle's nvlist.
    fn user_props(&self, handle: &DatasetHandle, dataset: &str) -> HashMap<String, RawProperty> {
        let mut props = HashMap::new();
        let nvl = unsafe { ffi::zfs_get_user_props(handle.handle) };
        if nvl.is_null() {
            return props;
        }
        let mut pair: *mut ffi::NvPair = ptr::null_mut();
        loop {
            pair = unsafe { ffi::nvlist_next_nvpair(nvl, pair) };
            if pair.is_null() {
                break;
            }
            let name_ptr = unsafe { ffi::nvpair_name(pair) };
            if name_ptr.is_null() {
                continue;
            }
            let name = unsafe { CStr::from_ptr(name_ptr) }.to_string_lossy().into_owned();

            let mut entry: *mut ffi::NvList = ptr::null_mut();
            if unsafe { ffi::nvpair_value_nvlist(pair, &mut entry) } != 0 || entry.is_null() {
                continue;
            }
            let Some(value) = nvlist_string(entry, "value") else {
                continue;
            };
            let source = match nvlist_string(entry, "source") {
                Some(src) if src == dataset => "local".to_string(),
                Some(src) => format!("inherited from {src}"),
                None => "-".to_string(),
            };
            props.insert(name, RawProperty::new(value, source));
        }
        props
    }
}

impl Adapter for LibZfsAdapter {
    fn pools(&self) -> Result<Vec<String>, AdapterError> {
        struct IterData {
            names: Vec<String>,
        }

        extern "C" fn pool_callback(
            zhp: *mut ffi::ZpoolHandle,
            data: *mut std::os::raw::c_void,
        ) -> c_int {
            let data = unsafe { &mut *(data as *mut IterData) };
            let name_ptr = unsafe { ffi::zpool_get_name(zhp) };
            if !name_ptr.is_null() {
                let name = unsafe { CStr::from_ptr(name_ptr) }.to_string_lossy().into_owned();
                data.names.push(name);
            }
            unsafe { ffi::zpool_close(zhp) };
            0
        }

        let mut data = IterData { names: Vec::new() };
        let result = unsafe {
            ffi::zpool_iter(
                self.lzh.handle,
                pool_callback,
                &mut data as *mut IterData as *mut std::os::raw::c_void,
            )
        };
        if result != 0 {
            return Err(self.lzh.error("(pools)"));
        }
        Ok(data.names)
    }

    fn children(&self, dataset: &str, recursive: bool) -> Result<Vec<String>, AdapterError> {
        let mut names = Vec::new();
        self.collect_children(dataset, recursive, &mut names)?;
        Ok(names)
    }

    fn properties(&self, dataset: &str) -> Result<HashMap<String, RawProperty>, AdapterError> {
        let handle = self.open_any(dataset)?;
        let mut props = HashMap::new();

        let creation = self.numeric_prop(&handle, ffi::ZFS_PROP_CREATION).unwrap_or(0);
        props.insert(
            CREATION_PROP.to_string(),
            RawProperty::new(creation.to_string(), "-"),
        );

        if is_snapshot_name(dataset) {
            // Snapshots have no mountpoint of their own; report their
            // filesystem's.
            let fs = super::dataset::filesystem_of(dataset);
            if let Ok(parent) = self.open(fs, ffi::ZFS_TYPE_FILESYSTEM) {
                if let Some(mountpoint) = self.string_prop(&parent, ffi::ZFS_PROP_MOUNTPOINT) {
                    props.insert(MOUNTPOINT_PROP.to_string(), mountpoint);
                }
            }
            props.insert(CANMOUNT_PROP.to_string(), RawProperty::new("-", "-"));
            props.insert(MOUNTED_PROP.to_string(), RawProperty::new("no", "-"));
        } else {
            if let Some(mountpoint) = self.string_prop(&handle, ffi::ZFS_PROP_MOUNTPOINT) {
                props.insert(MOUNTPOINT_PROP.to_string(), mountpoint);
            }
            if let Some(canmount) = self.string_prop(&handle, ffi::ZFS_PROP_CANMOUNT) {
                props.insert(CANMOUNT_PROP.to_string(), canmount);
            }
            let mounted = unsafe { ffi::zfs_is_mounted(handle.handle, ptr::null_mut()) } != 0;
            props.insert(
                MOUNTED_PROP.to_string(),
                RawProperty::new(if mounted { "yes" } else { "no" }, "-"),
            );
            if let Some(origin) = self.string_prop(&handle, ffi::ZFS_PROP_ORIGIN) {
                if !origin.value.is_empty() && origin.value != "-" {
                    props.insert(
                        ORIGIN_PROP.to_string(),
                        RawProperty::new(origin.value, "-"),
                    );
                }
            }
        }

        for (name, prop) in self.user_props(&handle, dataset) {
            props.insert(name, prop);
        }
        Ok(props)
    }

    fn create_snapshot(
        &mut self,
        dataset: &str,
        snap_name: &str,
        recursive: bool,
    ) -> Result<(), AdapterError> {
        let full = format!("{dataset}@{snap_name}");
        let cname = cstring(&full)?;
        let result = unsafe {
            ffi::zfs_snapshot(
                self.lzh.handle,
                cname.as_ptr(),
                recursive as c_int,
                ptr::null_mut(),
            )
        };
        if result != 0 {
            return Err(self.lzh.error(&full));
        }
        Ok(())
    }

    fn clone_snapshot(
        &mut self,
        snapshot: &str,
        target: &str,
        overrides: &[(String, String)],
    ) -> Result<(), AdapterError> {
        let handle = self.open(snapshot, ffi::ZFS_TYPE_SNAPSHOT)?;
        let ctarget = cstring(target)?;
        let result = unsafe { ffi::zfs_clone(handle.handle, ctarget.as_ptr(), ptr::null_mut()) };
        if result != 0 {
            return Err(self.lzh.error(target));
        }
        // Shape the clone before anything can auto-mount it.
        let clone = self.open(target, ffi::ZFS_TYPE_FILESYSTEM)?;
        for (name, value) in overrides {
            clone.set_property(&self.lzh, name, value)?;
        }
        Ok(())
    }

    fn promote(&mut self, dataset: &str) -> Result<(), AdapterError> {
        let handle = self.open(dataset, ffi::ZFS_TYPE_FILESYSTEM)?;
        let result = unsafe { ffi::zfs_promote(handle.handle) };
        if result != 0 {
            return Err(self.lzh.error(dataset));
        }
        Ok(())
    }

    fn destroy(&mut self, dataset: &str) -> Result<(), AdapterError> {
        let handle = self.open_any(dataset)?;
        let result = unsafe { ffi::zfs_destroy(handle.handle, 0) };
        if result != 0 {
            return Err(self.lzh.error(dataset));
        }
        Ok(())
    }

    fn set_property(
        &mut self,
        dataset: &str,
        name: &str,
        value: &str,
    ) -> Result<(), AdapterError> {
        let handle = self.open(dataset, ffi::ZFS_TYPE_FILESYSTEM)?;
        handle.set_property(&self.lzh, name, value)
    }

    fn inherit_property(&mut self, dataset: &str, name: &str) -> Result<(), AdapterError> {
        let handle = self.open(dataset, ffi::ZFS_TYPE_FILESYSTEM)?;
        let cprop = cstring(name)?;
        let result = unsafe { ffi::zfs_prop_inherit(handle.handle, cprop.as_ptr(), 0) };
        if result != 0 {
            return Err(self.lzh.error(dataset));
        }
        Ok(())
    }
}

/// Safe wrapper for operations on a ZFS dataset handle.
struct DatasetHandle {
    handle: *mut ffi::ZfsHandle,
    owns_handle: bool,
}

impl DatasetHandle {
    fn name(&self) -> Option<String> {
        let name_ptr = unsafe { ffi::zfs_get_name(self.handle) };
        if name_ptr.is_null() {
            // The libzfs API claims this is not possible.
            return None;
        }
        Some(unsafe { CStr::from_ptr(name_ptr) }.to_string_lossy().into_owned())
    }

    fn set_property(&self, lzh: &LibHandle, name: &str, value: &str) -> Result<(), AdapterError> {
        let dataset = self.name().unwrap_or_default();
        let cprop = cstring(name)?;
        let cvalue = cstring(value)?;
        let result = unsafe { ffi::zfs_prop_set(self.handle, cprop.as_ptr(), cvalue.as_ptr()) };
        if result != 0 {
            return Err(lzh.error(&dataset));
        }
        Ok(())
    }
}

impl Drop for DatasetHandle {
    fn drop(&mut self) {
        if !self.owns_handle || self.handle.is_null() {
            return;
        }
        unsafe {
            ffi::zfs_close(self.handle);
        }
    }
}

// Collects dataset names out of the libzfs iteration callbacks. Each handle
// the iterator opens is adopted and closed again on drop.
#[derive(Default)]
struct NameCollector {
    names: Vec<String>,
}

impl NameCollector {
    fn as_mut_ptr(&mut self) -> *mut std::os::raw::c_void {
        self as *mut NameCollector as *mut std::os::raw::c_void
    }

    extern "C" fn callback(zhp: *mut ffi::ZfsHandle, data: *mut std::os::raw::c_void) -> c_int {
        let collector = unsafe { &mut *(data as *mut NameCollector) };
        let child = DatasetHandle {
            handle: zhp,
            owns_handle: true,
        };
        if let Some(name) = child.name() {
            collector.names.push(name);
        }
        0
    }
}

// Wraps the libzfs handle to manage its lifetime.
struct LibHandle {
    handle: *mut ffi::LibzfsHandle,
}

impl LibHandle {
    fn new() -> Result<Self, AdapterError> {
        let handle = unsafe { ffi::libzfs_init() };
        if handle.is_null() {
            Err(AdapterError::new("(init)", "failed to initialize libzfs"))
        } else {
            Ok(LibHandle { handle })
        }
    }

    /// Surface the current libzfs error for the given dataset.
    fn error(&self, dataset: &str) -> AdapterError {
        let errno = unsafe { ffi::libzfs_errno(self.handle) };
        let desc_ptr = unsafe { ffi::libzfs_error_description(self.handle) };
        let description = if desc_ptr.is_null() {
            // This should never happen (tm).
            "unknown".to_string()
        } else {
            unsafe { CStr::from_ptr(desc_ptr) }.to_string_lossy().into_owned()
        };
        AdapterError::new(dataset, format!("{description} (errno {errno})"))
    }
}

impl Drop for LibHandle {
    fn drop(&mut self) {
        unsafe {
            ffi::libzfs_fini(self.handle);
        }
    }
}

fn cstring(name: &str) -> Result<CString, AdapterError> {
    CString::new(name).map_err(|_| AdapterError::new(name, "name contains a nul byte"))
}

fn truncate_at_nul(mut buf: Vec<u8>) -> Option<String> {
    if let Some(null_pos) = buf.iter().position(|&b| b == 0) {
        buf.truncate(null_pos);
    }
    String::from_utf8(buf).ok()
}

// Translate the zprop_source_t bitmask into the tag encoding the scanner
// parses ("local", "default", "inherited from <dataset>", "-").
fn source_tag(srctype: c_int, origin: &str) -> String {
    if srctype & ffi::ZPROP_SRC_LOCAL != 0 {
        "local".to_string()
    } else if srctype & ffi::ZPROP_SRC_DEFAULT != 0 {
        "default".to_string()
    } else if srctype & ffi::ZPROP_SRC_INHERITED != 0 {
        format!("inherited from {origin}")
    } else {
        "-".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_tag_mapping() {
        assert_eq!(source_tag(ffi::ZPROP_SRC_LOCAL, ""), "local");
        assert_eq!(source_tag(ffi::ZPROP_SRC_DEFAULT, ""), "default");
        assert_eq!(
            source_tag(ffi::ZPROP_SRC_INHERITED, "rpool/ROOT"),
            "inherited from rpool/ROOT"
        );
        assert_eq!(source_tag(ffi::ZPROP_SRC_NONE, ""), "-");
        assert_eq!(source_tag(0, ""), "-");
    }

    #[test]
    fn test_truncate_at_nul() {
        assert_eq!(truncate_at_nul(b"abc\0def".to_vec()), Some("abc".to_string()));
        assert_eq!(truncate_at_nul(b"abc".to_vec()), Some("abc".to_string()));
        assert_eq!(truncate_at_nul(Vec::new()), Some(String::new()));
    }

    #[test]
    fn test_cstring_rejects_nul() {
        assert!(cstring("rpool/ROOT").is_ok());
        assert!(cstring("rpool\0ROOT").is_err());
    }
}

// libzfs FFI bindings
mod ffi {
    use std::os::raw::{c_char, c_int, c_void};

    // Opaque handle types matching libzfs
    #[repr(C)]
    pub struct LibzfsHandle {
        _opaque: [u8; 0],
    }

    #[repr(C)]
    pub struct ZfsHandle {
        _opaque: [u8; 0],
    }

    #[repr(C)]
    pub struct ZpoolHandle {
        _opaque: [u8; 0],
    }

    #[repr(C)]
    pub struct NvList {
        _opaque: [u8; 0],
    }

    #[repr(C)]
    pub struct NvPair {
        _opaque: [u8; 0],
    }

    // ZFS type constants from sys/fs/zfs.h
    pub const ZFS_TYPE_FILESYSTEM: c_int = 1 << 0;
    pub const ZFS_TYPE_SNAPSHOT: c_int = 1 << 1;

    // ZFS property constants from sys/fs/zfs.h
    pub const ZFS_PROP_CREATION: c_int = 1;
    pub const ZFS_PROP_ORIGIN: c_int = 7;
    pub const ZFS_PROP_MOUNTPOINT: c_int = 13;
    pub const ZFS_PROP_CANMOUNT: c_int = 28;

    // zprop_source_t bits from libzfs.h
    pub const ZPROP_SRC_NONE: c_int = 0x1;
    pub const ZPROP_SRC_DEFAULT: c_int = 0x2;
    pub const ZPROP_SRC_LOCAL: c_int = 0x8;
    pub const ZPROP_SRC_INHERITED: c_int = 0x10;

    pub type ZfsProp = c_int;

    unsafe extern "C" {
        // Library initialization
        pub fn libzfs_init() -> *mut LibzfsHandle;
        pub fn libzfs_fini(hdl: *mut LibzfsHandle);

        // Error handling
        pub fn libzfs_errno(hdl: *mut LibzfsHandle) -> c_int;
        pub fn libzfs_error_description(hdl: *mut LibzfsHandle) -> *const c_char;

        // Dataset handle management
        pub fn zfs_open(
            hdl: *mut LibzfsHandle,
            name: *const c_char,
            types: c_int,
        ) -> *mut ZfsHandle;
        pub fn zfs_close(zhp: *mut ZfsHandle);
        pub fn zfs_get_name(zhp: *mut ZfsHandle) -> *const c_char;

        // Mutating operations
        pub fn zfs_snapshot(
            hdl: *mut LibzfsHandle,
            path: *const c_char,
            recursive: c_int,
            props: *mut NvList,
        ) -> c_int;
        pub fn zfs_clone(
            zhp: *mut ZfsHandle,
            target: *const c_char,
            props: *mut NvList,
        ) -> c_int;
        pub fn zfs_promote(zhp: *mut ZfsHandle) -> c_int;
        pub fn zfs_destroy(zhp: *mut ZfsHandle, defer: c_int) -> c_int;
        pub fn zfs_prop_set(
            zhp: *mut ZfsHandle,
            propname: *const c_char,
            propval: *const c_char,
        ) -> c_int;
        pub fn zfs_prop_inherit(
            zhp: *mut ZfsHandle,
            propname: *const c_char,
            received: c_int,
        ) -> c_int;

        // Mount state
        pub fn zfs_is_mounted(zhp: *mut ZfsHandle, where_: *mut *mut c_char) -> c_int;

        // Iterator functions
        pub fn zfs_iter_filesystems(
            zhp: *mut ZfsHandle,
            func: extern "C" fn(*mut ZfsHandle, *mut c_void) -> c_int,
            data: *mut c_void,
        ) -> c_int;
        pub fn zfs_iter_snapshots(
            zhp: *mut ZfsHandle,
            simple: c_int,
            func: extern "C" fn(*mut ZfsHandle, *mut c_void) -> c_int,
            data: *mut c_void,
            min_txg: u64,
            max_txg: u64,
        ) -> c_int;

        // Property functions
        pub fn zfs_prop_get(
            zhp: *mut ZfsHandle,
            prop: ZfsProp,
            buf: *mut c_char,
            len: usize,
            srctype: *mut c_int,
            statbuf: *mut c_char,
            statlen: usize,
            literal: c_int,
        ) -> c_int;
        pub fn zfs_prop_get_numeric(
            zhp: *mut ZfsHandle,
            prop: ZfsProp,
            value: *mut u64,
            source: *mut c_int,
            buf: *mut c_char,
            len: usize,
        ) -> c_int;
        pub fn zfs_get_user_props(zhp: *mut ZfsHandle) -> *mut NvList;

        // nvlist accessors for user properties
        pub fn nvlist_next_nvpair(nvl: *mut NvList, pair: *mut NvPair) -> *mut NvPair;
        pub fn nvpair_name(pair: *mut NvPair) -> *mut c_char;
        pub fn nvpair_value_nvlist(pair: *mut NvPair, out: *mut *mut NvList) -> c_int;
        pub fn nvlist_lookup_string(
            nvl: *mut NvList,
            name: *const c_char,
            out: *mut *mut c_char,
        ) -> c_int;

        // ZPool functions
        pub fn zpool_iter(
            hdl: *mut LibzfsHandle,
            func: extern "C" fn(*mut ZpoolHandle, *mut c_void) -> c_int,
            data: *mut c_void,
        ) -> c_int;
        pub fn zpool_get_name(zhp: *mut ZpoolHandle) -> *const c_char;
        pub fn zpool_close(zhp: *mut ZpoolHandle);
    }
}

fn nvlist_string(nvl: *mut ffi::NvList, key: &str) -> Option<String> {
    let ckey = CString::new(key).ok()?;
    let mut out: *mut c_char = ptr::null_mut();
    let result = unsafe { ffi::nvlist_lookup_string(nvl, ckey.as_ptr(), &mut out) };
    if result != 0 || out.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(out) }.to_string_lossy().into_owned())
}
