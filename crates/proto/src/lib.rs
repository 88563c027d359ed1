//! Protobuf types and gRPC stubs for the machine management API.
//!
//! This crate provides the generated types and service traits for the subset
//! of the API the agent consumes: `Version`, `Bootstrap` and `EtcdMemberList`
//! on the machine service, plus typed resource lookups on the resource
//! service. Server traits are generated as well so tests can stand up a fake
//! machined endpoint without the real host OS.

#![deny(unsafe_code)]
// gRPC services return tonic::Status - standard practice for gRPC error handling
#![allow(clippy::result_large_err)]

/// Generated protobuf types and service traits.
pub mod proto {
    #![allow(clippy::all)]
    #![allow(missing_docs)]

    tonic::include_proto!("machine.v1");
}
