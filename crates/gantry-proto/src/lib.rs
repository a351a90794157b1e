//! Protobuf sources for Gantry.
//!
//! Compiled at build time with the vendored `protoc`:
//! - `google.api.http` route annotations (`HttpRule`)
//! - the sample `gantry.system.v1.IdpService` contract
//!
//! [`FILE_DESCRIPTOR_SET`] holds the encoded descriptors of every compiled file
//! and its imports, including custom method options.

use prost_reflect::{DescriptorError, DescriptorPool};

pub mod google {
    pub mod api {
        //! Generated from proto/google/api/{http,annotations}.proto

        include!(concat!(env!("OUT_DIR"), "/google.api.rs"));
    }
}

pub mod system {
    pub mod v1 {
        //! Generated from proto/gantry/system/v1/idp.proto

        include!(concat!(env!("OUT_DIR"), "/gantry.system.v1.rs"));
    }
}

/// Encoded `FileDescriptorSet` of all compiled protos
pub const FILE_DESCRIPTOR_SET: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/gantry_descriptor.bin"));

/// Fully qualified name of the sample service
pub const IDP_SERVICE: &str = "gantry.system.v1.IdpService";

/// Decode [`FILE_DESCRIPTOR_SET`] into a descriptor pool
pub fn descriptor_pool() -> Result<DescriptorPool, DescriptorError> {
    DescriptorPool::decode(FILE_DESCRIPTOR_SET)
}
