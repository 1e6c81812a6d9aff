//! Error taxonomy of the host stack.
//!
//! Three tiers, matching how faults propagate: [`RequestError`] rejects an
//! API call up front; [`EndpointFault`] completes a transfer with an error
//! the owning driver must acknowledge; [`HoldReason`] parks the whole device
//! until physical detach.

use thiserror::Error;

use crate::hal::BusFault;

/// Why a transfer request was refused before anything was queued.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum RequestError {
    #[error("no device at that address")]
    UnknownDevice,
    #[error("host is not in the running state")]
    InvalidState,
    #[error("endpoint not found on the device")]
    EndpointNotFound,
    #[error("a transfer is already in progress on the endpoint")]
    Busy,
    #[error("endpoint is stalled and must be cleared first")]
    Stalled,
    #[error("endpoint is in an error state and must be cleared first")]
    EndpointError,
    #[error("control endpoints cannot be used for this request")]
    IllegalEndpointType,
    #[error("transfer direction does not match the endpoint")]
    IllegalDirection,
    #[error("request is not legal in this form")]
    IllegalRequest,
}

/// Why a queued transfer completed unsuccessfully.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum EndpointFault {
    #[error("device stalled the endpoint")]
    Stalled,
    #[error("NAK budget exhausted")]
    NakTimeout,
    #[error("transaction retry ceiling reached: {0:?}")]
    Bus(BusFault),
}

/// Terminal enumeration outcome; clears only on physical detach.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum HoldReason {
    #[error("no configuration of the device is supported")]
    UnsupportedDevice,
    #[error("hub cannot be supported")]
    UnsupportedHub,
    #[error("device did not enumerate within the retry budget")]
    CannotEnumerate,
    #[error("a client driver failed to initialize")]
    ClientInitFailed,
    #[error("out of device or hub resources")]
    OutOfMemory,
    #[error("unspecified enumeration failure")]
    Unspecified,
}
