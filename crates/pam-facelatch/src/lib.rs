//! pam_facelatch — PAM module for facelatch face authentication.
//!
//! Runs one bounded decision in-process: load the configuration, open the
//! camera, call `facelatch_core::decide`, map the verdict to a PAM code.
//!
//! | Decision  | PAM code         |
//! |-----------|------------------|
//! | `Success` | `PAM_SUCCESS`    |
//! | `Failure` | `PAM_AUTH_ERR`   |
//! | `Timeout` | `PAM_AUTH_ERR`   |
//! | `Error`   | `PAM_SYSTEM_ERR` |
//!
//! The one exception is a user with no model under `missing_model = "defer"`,
//! which returns `PAM_IGNORE` so the stack falls through to the next factor.
//! A broken camera, model or configuration never skips this module.
//!
//! # Safety
//!
//! All Rust logic runs inside `catch_unwind`; a panic unwinding across the
//! `extern "C"` boundary is undefined behaviour. A caught panic is reported
//! as `PAM_SYSTEM_ERR`.
//!
//! Module arguments: `config=/path/to/config.toml`.

#![warn(unsafe_op_in_unsafe_fn)]

use facelatch_core::{
    config::is_valid_username, decide, missing_model, AuthConfig, CancelToken, Decision, ErrorKind, FilesystemModelStore,
    ModelStore,
};
use facelatch_hw::{Camera, GrayscaleExtractor};
use std::ffi::{CStr, CString};
use std::panic;
use std::path::{Path, PathBuf};
use std::ptr;

// PAM return codes (Linux-PAM values)
const PAM_SUCCESS: libc::c_int = 0;
const PAM_SYSTEM_ERR: libc::c_int = 4;
const PAM_AUTH_ERR: libc::c_int = 7;
const PAM_IGNORE: libc::c_int = 25;

// PAM item types
const PAM_CONV: libc::c_int = 5;

// PAM message styles
const PAM_TEXT_INFO: libc::c_int = 4;

// syslog constants
const LOG_PID: libc::c_int = 0x01;
const LOG_AUTHPRIV: libc::c_int = 10 << 3;
const LOG_INFO: libc::c_int = 6;
const LOG_NOTICE: libc::c_int = 5;
const LOG_WARNING: libc::c_int = 4;
const LOG_ERR: libc::c_int = 3;

extern "C" {
    fn pam_get_user(
        pamh: *mut libc::c_void,
        user: *mut *const libc::c_char,
        prompt: *const libc::c_char,
    ) -> libc::c_int;

    fn pam_get_item(
        pamh: *mut libc::c_void,
        item_type: libc::c_int,
        item: *mut *const libc::c_void,
    ) -> libc::c_int;
}

/// Mirrors `struct pam_message` from <security/pam_appl.h>.
#[repr(C)]
struct PamMessage {
    msg_style: libc::c_int,
    msg: *const libc::c_char,
}

/// Mirrors `struct pam_response`.
#[repr(C)]
struct PamResponse {
    resp: *mut libc::c_char,
    resp_retcode: libc::c_int,
}

/// Mirrors `struct pam_conv`.
#[repr(C)]
struct PamConv {
    conv: Option<
        unsafe extern "C" fn(
            num_msg: libc::c_int,
            msg: *mut *const PamMessage,
            resp: *mut *mut PamResponse,
            appdata_ptr: *mut libc::c_void,
        ) -> libc::c_int,
    >,
    appdata_ptr: *mut libc::c_void,
}

fn syslog_open() {
    static IDENT: &[u8] = b"pam_facelatch\0";
    // SAFETY: IDENT is a NUL-terminated static and outlives every syslog call.
    unsafe {
        libc::openlog(IDENT.as_ptr() as *const libc::c_char, LOG_PID, LOG_AUTHPRIV);
    }
}

fn syslog_msg(priority: libc::c_int, msg: &str) {
    let Ok(c_msg) = CString::new(msg) else {
        return;
    };
    // "%s" keeps user-controlled text out of the format string.
    let fmt = b"%s\0";
    // SAFETY: both pointers are valid NUL-terminated C strings.
    unsafe {
        libc::syslog(priority, fmt.as_ptr() as *const libc::c_char, c_msg.as_ptr());
    }
}

/// Best-effort PAM_TEXT_INFO through the application's conversation.
fn send_text_info(pamh: *mut libc::c_void, text: &str) {
    let Ok(c_text) = CString::new(text) else {
        return;
    };

    let mut conv_ptr: *const libc::c_void = ptr::null();
    // SAFETY: pamh is the handle PAM passed to pam_sm_authenticate.
    let ret = unsafe { pam_get_item(pamh, PAM_CONV, &mut conv_ptr) };
    if ret != PAM_SUCCESS || conv_ptr.is_null() {
        return;
    }

    // SAFETY: PAM_CONV items are `struct pam_conv`.
    let conv = unsafe { &*(conv_ptr as *const PamConv) };
    let Some(conv_fn) = conv.conv else {
        return;
    };

    let msg = PamMessage {
        msg_style: PAM_TEXT_INFO,
        msg: c_text.as_ptr(),
    };
    let msg_ptr: *const PamMessage = &msg;
    let mut resp_ptr: *mut PamResponse = ptr::null_mut();

    // SAFETY: msg_ptr points at one valid message; the application owns
    // nothing we pass and we free whatever response it allocates.
    unsafe {
        conv_fn(1, &msg_ptr as *const _ as *mut _, &mut resp_ptr, conv.appdata_ptr);
        if !resp_ptr.is_null() {
            if !(*resp_ptr).resp.is_null() {
                libc::free((*resp_ptr).resp as *mut libc::c_void);
            }
            libc::free(resp_ptr as *mut libc::c_void);
        }
    }
}

fn pam_code(decision: &Decision) -> libc::c_int {
    match decision {
        Decision::Success { .. } => PAM_SUCCESS,
        Decision::Failure { .. } | Decision::Timeout => PAM_AUTH_ERR,
        Decision::Error {
            kind: ErrorKind::ModelMissing,
            ..
        } => PAM_IGNORE,
        Decision::Error { .. } => PAM_SYSTEM_ERR,
    }
}

/// `config=` from the module arguments, last one wins.
fn config_arg<'a, I>(args: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = &'a str>,
{
    args.into_iter()
        .filter_map(|arg| arg.strip_prefix("config="))
        .last()
        .map(PathBuf::from)
}

fn config_error(detail: String) -> Decision {
    Decision::Error {
        kind: ErrorKind::Config,
        detail,
    }
}

fn authenticate(user: &str, config_path: Option<&Path>) -> Decision {
    if !is_valid_username(user) {
        return config_error(format!("refusing username {user:?}"));
    }
    let config = match AuthConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => return config_error(e.to_string()),
    };
    if !config.method.is_classic() {
        return config_error(format!(
            "{} needs an external embedding extractor",
            config.method
        ));
    }

    let path = match config.model_path(user) {
        Ok(path) => path,
        Err(e) => return config_error(e.to_string()),
    };
    let store = FilesystemModelStore;
    if !store.exists(&path) {
        return missing_model(&config, &path);
    }

    let camera = match Camera::open(&config.camera_device) {
        Ok(camera) => camera,
        Err(e) => {
            return Decision::Error {
                kind: ErrorKind::Resource,
                detail: e.to_string(),
            }
        }
    };
    let mut stream = match camera.stream(config.dark_threshold, config.frame_interval()) {
        Ok(stream) => stream,
        Err(e) => {
            return Decision::Error {
                kind: ErrorKind::Resource,
                detail: e.to_string(),
            }
        }
    };
    let mut extractor = GrayscaleExtractor::from_config(&config);

    decide(&config, &store, &path, &mut stream, &mut extractor, &CancelToken::new())
}

fn report(user: &str, decision: &Decision) {
    match decision {
        Decision::Success { label, score } => syslog_msg(
            LOG_INFO,
            &format!("face matched for user '{user}' as '{label}' (score {score:.3})"),
        ),
        Decision::Failure { reason } => {
            syslog_msg(LOG_NOTICE, &format!("no match for user '{user}': {reason:?}"))
        }
        Decision::Timeout => syslog_msg(LOG_NOTICE, &format!("timed out for user '{user}'")),
        Decision::Error { kind, detail } => {
            syslog_msg(LOG_WARNING, &format!("{kind:?} error for user '{user}': {detail}"))
        }
    }
}

/// PAM authentication entry point (`auth sufficient pam_facelatch.so`).
///
/// # Safety
///
/// `pamh` must be a valid PAM handle and `argv` must hold `argc` valid C
/// strings, as provided by the PAM framework.
#[no_mangle]
pub unsafe extern "C" fn pam_sm_authenticate(
    pamh: *mut libc::c_void,
    _flags: libc::c_int,
    argc: libc::c_int,
    argv: *const *const libc::c_char,
) -> libc::c_int {
    let result = panic::catch_unwind(|| {
        syslog_open();

        let mut args: Vec<&str> = Vec::new();
        if !argv.is_null() {
            for i in 0..usize::try_from(argc).unwrap_or(0) {
                // SAFETY: PAM passes argc valid NUL-terminated strings.
                let arg = unsafe { *argv.add(i) };
                if arg.is_null() {
                    continue;
                }
                if let Ok(s) = unsafe { CStr::from_ptr(arg) }.to_str() {
                    args.push(s);
                }
            }
        }
        let config_path = config_arg(args);

        let mut user_ptr: *const libc::c_char = ptr::null();
        // SAFETY: pamh is valid; pam_get_user stores a pointer owned by PAM.
        let ret = unsafe { pam_get_user(pamh, &mut user_ptr, ptr::null()) };
        if ret != PAM_SUCCESS || user_ptr.is_null() {
            syslog_msg(LOG_ERR, &format!("pam_get_user failed (ret={ret})"));
            return PAM_SYSTEM_ERR;
        }
        // SAFETY: non-null and NUL-terminated for the life of the transaction.
        let Ok(user) = unsafe { CStr::from_ptr(user_ptr) }.to_str() else {
            syslog_msg(LOG_WARNING, "username is not valid UTF-8");
            return PAM_SYSTEM_ERR;
        };

        let decision = authenticate(user, config_path.as_deref());
        report(user, &decision);
        if decision.is_success() {
            send_text_info(pamh, "facelatch: face recognized");
        }
        pam_code(&decision)
    });

    result.unwrap_or_else(|_| {
        syslog_msg(LOG_ERR, "panic during authentication");
        PAM_SYSTEM_ERR
    })
}

/// Credentials are not managed here.
///
/// # Safety
///
/// Never dereferences its arguments.
#[no_mangle]
pub unsafe extern "C" fn pam_sm_setcred(
    _pamh: *mut libc::c_void,
    _flags: libc::c_int,
    _argc: libc::c_int,
    _argv: *const *const libc::c_char,
) -> libc::c_int {
    PAM_IGNORE
}
