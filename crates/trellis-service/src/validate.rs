//! Pre-dispatch argument validation.

use trellis_core::ValidationError;
use trellis_core::types::ParameterMetadata;
use trellis_core::validation::infer_kind;
use trellis_core::validation::is_type_compatible;

use crate::dispatcher::ArgsMap;

/// Validate request args against a method's declared parameters.
///
/// Required parameters must be present; present parameters must carry a
/// value whose runtime kind satisfies the declared type. The first
/// failure wins.
pub fn validate_args(params: &[ParameterMetadata], args: &ArgsMap) -> Result<(), ValidationError> {
    for param in params {
        match args.get(&param.name) {
            None if param.required => return Err(ValidationError::missing(&param.name, param.param_type)),
            None => continue,
            Some(value) => {
                let kind = infer_kind(value);
                if !is_type_compatible(param.param_type, kind) {
                    return Err(ValidationError::mismatch(&param.name, param.param_type, kind, value));
                }
            }
        }
    }
    Ok(())
}

/// Recover the mismatched parameter after a handler died mid-call.
///
/// Fallback path only: when a handler panics, re-scan the args against
/// the metadata and report the first incompatible parameter. Returns
/// `None` when every present parameter checks out.
pub fn reconstruct_mismatch(params: &[ParameterMetadata], args: &ArgsMap) -> Option<ValidationError> {
    for param in params {
        if let Some(value) = args.get(&param.name) {
            let kind = infer_kind(value);
            if !is_type_compatible(param.param_type, kind) {
                return Some(ValidationError::mismatch(&param.name, param.param_type, kind, value));
            }
        }
    }
    None
}
