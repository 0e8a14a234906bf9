//! Value and codec error types.

use thiserror::Error;

/// Errors raised while validating, encoding, or decoding node values.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Existing variants will not be removed in minor versions
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ValueError {
    /// A null value appeared as an array element.
    #[error("Array element {index} is null; arrays cannot contain null values")]
    NullArrayElement {
        /// The offending element index
        index: usize,
    },

    /// A null value appeared as an object property in a full set payload
    /// while `remove_void_properties` is disabled.
    #[error("Property '{key}' is null; enable remove_void_properties to drop it")]
    VoidProperty {
        /// The offending property key
        key: String,
    },

    /// The wire data carried a type code outside the known range.
    #[error("Unknown value type code {code}")]
    UnknownTypeCode {
        /// The unrecognized code
        code: u8,
    },

    /// A tagged value's payload does not match its type code.
    #[error("Malformed tagged value for type code {code}: {reason}")]
    MalformedTaggedValue {
        /// The type code of the tagged value
        code: u8,
        /// Why the payload was rejected
        reason: String,
    },

    /// ASCII85 text could not be decoded.
    #[error("Invalid ASCII85 data: {reason}")]
    InvalidAscii85 {
        /// Why the text was rejected
        reason: String,
    },

    /// A path reference inside a value failed path validation.
    #[error("Invalid path reference")]
    InvalidReference {
        /// The underlying path error
        #[source]
        source: crate::path::PathError,
    },

    /// A JSON value had no representation as a node value.
    #[error("Cannot decode JSON value: {reason}")]
    UnsupportedJson {
        /// Why the JSON was rejected
        reason: String,
    },
}
