//! C FFI surface for yiyan.
//!
//! Pattern: opaque CoordinatorHandle + C strings + JSON serialization.
//! Playback state crosses the boundary as `{"isPlaying": bool, "currentSource": string|null}`.
//!
//! State-change callbacks run on whichever thread caused the change (the
//! caller's own thread for transport calls, a backend thread for natural
//! ends). The JSON pointer is only valid for the duration of the call.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::ptr;

use parking_lot::Mutex;
use yiyan_core::{Coordinator, PlaybackSource, PlaybackState, Subscription};

// ---------------------------------------------------------------------------
// Error handling (thread-local last error)
// ---------------------------------------------------------------------------

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_error(msg: String) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(msg));
}

fn clear_error() {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = None);
}

/// Returns the last error message (caller frees with `yiyan_string_free`).
#[no_mangle]
pub extern "C" fn yiyan_last_error() -> *mut c_char {
    LAST_ERROR.with(|cell| {
        cell.borrow_mut()
            .take()
            .and_then(|s| CString::new(s).ok())
            .map(|s| s.into_raw())
            .unwrap_or(ptr::null_mut())
    })
}

/// Frees a string returned from yiyan FFI.
///
/// # Safety
/// Must be a pointer returned from this FFI and not already freed.
#[no_mangle]
pub unsafe extern "C" fn yiyan_string_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        let _ = CString::from_raw(ptr);
    }
}

// ---------------------------------------------------------------------------
// Opaque handle
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct CoordinatorHandle {
    _private: [u8; 0],
}

struct CoordinatorHandleInner {
    coordinator: Coordinator,
    subscription: Mutex<Option<Subscription>>,
}

/// Receives the state JSON and the `user_data` given to `yiyan_subscribe`.
pub type StateChangeFn = extern "C" fn(state_json: *const c_char, user_data: *mut c_void);

/// Caller-owned context pointer. The caller promises it stays valid and
/// may be used from any thread until `yiyan_unsubscribe`/`yiyan_close`.
struct UserData(*mut c_void);

unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl UserData {
    fn get(&self) -> *mut c_void {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Opens a coordinator. `headless != 0` uses silent backends (no audio
/// device needed); otherwise the default output device is used.
#[no_mangle]
pub extern "C" fn yiyan_open(headless: i32) -> *mut CoordinatorHandle {
    clear_error();
    let coordinator = if headless != 0 { Coordinator::headless() } else { Coordinator::native() };
    let inner = CoordinatorHandleInner { coordinator, subscription: Mutex::new(None) };
    Box::into_raw(Box::new(inner)) as *mut CoordinatorHandle
}

/// Stops playback and releases the coordinator.
#[no_mangle]
pub extern "C" fn yiyan_close(handle: *mut CoordinatorHandle) {
    if !handle.is_null() {
        unsafe {
            let inner = Box::from_raw(handle as *mut CoordinatorHandleInner);
            if let Some(sub) = inner.subscription.lock().take() {
                sub.unsubscribe();
            }
            inner.coordinator.stop();
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Play an http(s) URL or local path through the streaming backend.
/// Returns 1 on success, 0 on error.
#[no_mangle]
pub extern "C" fn yiyan_play_url(handle: *mut CoordinatorHandle, url: *const c_char) -> i32 {
    clear_error();
    let coordinator = match coordinator_ref(handle) { Ok(c) => c, Err(e) => return err_zero(e) };
    let url = match read_cstr(url) { Ok(s) => s, Err(e) => return err_zero(e) };
    status(coordinator.play(PlaybackSource::Url(url)))
}

/// Decode and play an in-memory audio payload (e.g. WAV bytes).
/// Returns 1 on success, 0 on error.
///
/// # Safety
/// `data` must point to `len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn yiyan_play_bytes(handle: *mut CoordinatorHandle, data: *const u8, len: usize) -> i32 {
    clear_error();
    let coordinator = match coordinator_ref(handle) { Ok(c) => c, Err(e) => return err_zero(e) };
    if data.is_null() {
        return err_zero("null data pointer".into());
    }
    let bytes = std::slice::from_raw_parts(data, len).to_vec();
    status(coordinator.play(PlaybackSource::Raw(bytes)))
}

#[no_mangle]
pub extern "C" fn yiyan_pause(handle: *mut CoordinatorHandle) -> i32 {
    clear_error();
    match coordinator_ref(handle) {
        Ok(c) => {
            c.pause();
            1
        }
        Err(e) => err_zero(e),
    }
}

#[no_mangle]
pub extern "C" fn yiyan_resume(handle: *mut CoordinatorHandle) -> i32 {
    clear_error();
    match coordinator_ref(handle) {
        Ok(c) => status(c.resume()),
        Err(e) => err_zero(e),
    }
}

#[no_mangle]
pub extern "C" fn yiyan_stop(handle: *mut CoordinatorHandle) -> i32 {
    clear_error();
    match coordinator_ref(handle) {
        Ok(c) => {
            c.stop();
            1
        }
        Err(e) => err_zero(e),
    }
}

#[no_mangle]
pub extern "C" fn yiyan_seek(handle: *mut CoordinatorHandle, seconds: f64) -> i32 {
    clear_error();
    match coordinator_ref(handle) {
        Ok(c) => {
            c.seek(seconds);
            1
        }
        Err(e) => err_zero(e),
    }
}

/// Volume in `[0, 1]`; out-of-range values are clamped.
#[no_mangle]
pub extern "C" fn yiyan_set_volume(handle: *mut CoordinatorHandle, volume: f32) -> i32 {
    clear_error();
    match coordinator_ref(handle) {
        Ok(c) => {
            c.set_volume(volume);
            1
        }
        Err(e) => err_zero(e),
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Seconds into the current source. 0 when idle or on a null handle.
#[no_mangle]
pub extern "C" fn yiyan_current_time(handle: *mut CoordinatorHandle) -> f64 {
    clear_error();
    match coordinator_ref(handle) {
        Ok(c) => c.current_time(),
        Err(e) => {
            set_error(e);
            0.0
        }
    }
}

/// Length of the current source in seconds. 0 when unknown or idle.
#[no_mangle]
pub extern "C" fn yiyan_duration(handle: *mut CoordinatorHandle) -> f64 {
    clear_error();
    match coordinator_ref(handle) {
        Ok(c) => c.duration(),
        Err(e) => {
            set_error(e);
            0.0
        }
    }
}

/// Current playback state as JSON (caller frees), or NULL on error.
#[no_mangle]
pub extern "C" fn yiyan_state(handle: *mut CoordinatorHandle) -> *mut c_char {
    clear_error();
    match coordinator_ref(handle) {
        Ok(c) => json_to_cstr(&c.state()),
        Err(e) => err_null(e),
    }
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// Register `callback` as the single state observer, replacing any previous
/// one. Returns 1 on success, 0 on error.
#[no_mangle]
pub extern "C" fn yiyan_subscribe(
    handle: *mut CoordinatorHandle,
    callback: Option<StateChangeFn>,
    user_data: *mut c_void,
) -> i32 {
    clear_error();
    let inner = match inner_ref(handle) { Ok(i) => i, Err(e) => return err_zero(e) };
    let callback = match callback { Some(cb) => cb, None => return err_zero("null callback".into()) };

    let user_data = UserData(user_data);
    let sub = inner.coordinator.on_state_change(move |state: &PlaybackState| {
        match serde_json::to_string(state).map(CString::new) {
            Ok(Ok(json)) => callback(json.as_ptr(), user_data.get()),
            _ => log::error!("yiyan: could not encode state for callback"),
        }
    });
    *inner.subscription.lock() = Some(sub);
    1
}

/// Remove the observer registered by `yiyan_subscribe`. Returns 1 on success.
#[no_mangle]
pub extern "C" fn yiyan_unsubscribe(handle: *mut CoordinatorHandle) -> i32 {
    clear_error();
    let inner = match inner_ref(handle) { Ok(i) => i, Err(e) => return err_zero(e) };
    if let Some(sub) = inner.subscription.lock().take() {
        sub.unsubscribe();
    }
    1
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Returns the FFI API version.
#[no_mangle]
pub extern "C" fn yiyan_version() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn inner_ref<'a>(handle: *mut CoordinatorHandle) -> Result<&'a CoordinatorHandleInner, String> {
    if handle.is_null() {
        return Err("null coordinator handle".into());
    }
    Ok(unsafe { &*(handle as *mut CoordinatorHandleInner) })
}

fn coordinator_ref<'a>(handle: *mut CoordinatorHandle) -> Result<&'a Coordinator, String> {
    inner_ref(handle).map(|inner| &inner.coordinator)
}

fn read_cstr(ptr: *const c_char) -> Result<String, String> {
    if ptr.is_null() {
        return Err("null string pointer".into());
    }
    unsafe {
        CStr::from_ptr(ptr)
            .to_str()
            .map(String::from)
            .map_err(|_| "invalid utf-8".into())
    }
}

fn status(result: yiyan_core::Result<()>) -> i32 {
    match result {
        Ok(()) => 1,
        Err(e) => err_zero(e.to_string()),
    }
}

fn json_to_cstr<T: serde::Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => to_cstr(json),
        Err(e) => err_null(e.to_string()),
    }
}

fn to_cstr(s: String) -> *mut c_char {
    CString::new(s)
        .map(|c| c.into_raw())
        .unwrap_or(ptr::null_mut())
}

fn err_null(msg: String) -> *mut c_char {
    set_error(msg);
    ptr::null_mut()
}

fn err_zero(msg: String) -> i32 {
    set_error(msg);
    0
}

// ---------------------------------------------------------------------------
// FFI Integration Tests
// ---------------------------------------------------------------------------
