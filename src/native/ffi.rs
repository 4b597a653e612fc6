//! Raw FFI bindings to the C wrapper layer in `csrc/mpcomm.c`.
//!
//! These are low-level unsafe functions. Use the safe wrappers in the parent module.

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_double, c_int, c_void};

// Type aliases matching the C header
pub type int32_t = i32;
pub type int64_t = i64;

extern "C" {
    // ============================================================
    // Initialization and Finalization
    // ============================================================

    pub fn mpcomm_init_thread(required: c_int, provided: *mut c_int) -> c_int;
    pub fn mpcomm_finalize() -> c_int;
    pub fn mpcomm_initialized(flag: *mut c_int) -> c_int;
    pub fn mpcomm_finalized(flag: *mut c_int) -> c_int;

    // ============================================================
    // Communicator Queries
    // ============================================================

    pub fn mpcomm_comm_world() -> int32_t;
    pub fn mpcomm_comm_rank(comm: int32_t, rank: *mut int32_t) -> c_int;
    pub fn mpcomm_comm_size(comm: int32_t, size: *mut int32_t) -> c_int;
    pub fn mpcomm_tag_ub(comm: int32_t, tag_ub: *mut int32_t) -> c_int;

    // ============================================================
    // Synchronization
    // ============================================================

    pub fn mpcomm_barrier(comm: int32_t) -> c_int;

    // ============================================================
    // Point-to-Point Communication
    // ============================================================

    pub fn mpcomm_send(
        buf: *const c_void,
        count: int64_t,
        datatype_tag: int32_t,
        dest: int32_t,
        tag: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpcomm_recv(
        buf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        source: int32_t,
        tag: int32_t,
        comm: int32_t,
        actual_source: *mut int32_t,
        actual_tag: *mut int32_t,
        actual_count: *mut int64_t,
    ) -> c_int;

    pub fn mpcomm_isend(
        buf: *const c_void,
        count: int64_t,
        datatype_tag: int32_t,
        dest: int32_t,
        tag: int32_t,
        comm: int32_t,
        request: *mut int64_t,
    ) -> c_int;

    pub fn mpcomm_irecv(
        buf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        source: int32_t,
        tag: int32_t,
        comm: int32_t,
        request: *mut int64_t,
    ) -> c_int;

    // ============================================================
    // Request Completion
    // ============================================================

    /// Waits on and releases `request`. The status out-params describe the
    /// matched message, counted in the element kind the request was posted
    /// with; `cancelled` is set if the operation was withdrawn.
    pub fn mpcomm_wait(
        request: int64_t,
        actual_source: *mut int32_t,
        actual_tag: *mut int32_t,
        actual_count: *mut int64_t,
        cancelled: *mut int32_t,
    ) -> c_int;

    /// Like `mpcomm_wait` without blocking; `flag` is nonzero once complete,
    /// in which case the request has been released.
    pub fn mpcomm_test(
        request: int64_t,
        flag: *mut int32_t,
        actual_source: *mut int32_t,
        actual_tag: *mut int32_t,
        actual_count: *mut int64_t,
        cancelled: *mut int32_t,
    ) -> c_int;

    pub fn mpcomm_cancel(request: int64_t) -> c_int;

    // ============================================================
    // Collective Operations
    // ============================================================

    pub fn mpcomm_bcast(
        buf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        root: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn mpcomm_allreduce(
        sendbuf: *const c_void,
        recvbuf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        op: int32_t,
        comm: int32_t,
    ) -> c_int;

    // ============================================================
    // Utility
    // ============================================================

    pub fn mpcomm_get_version(version: *mut c_char, len: *mut int32_t) -> c_int;
    pub fn mpcomm_wtime() -> c_double;
}
