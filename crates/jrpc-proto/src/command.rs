//! Command codec: positional parameters in, typed command out.

use serde_json::{Map, Value};

use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{Request, RpcError};
use crate::registry::{BoxedCommand, MethodInfo, Registry, json_kind, unregistered};

/// A request after envelope parsing and command decoding.
#[derive(Debug)]
pub struct ParsedRequest {
    pub id: Option<Value>,
    pub method: String,
    /// The decoded command, or the wire error describing why decoding failed.
    pub cmd: std::result::Result<BoxedCommand, RpcError>,
}

impl Registry {
    /// Decode `request` into the command registered for its method.
    ///
    /// # Errors
    ///
    /// Returns `UnregisteredMethod`, `WrongNumberOfParams` or `InvalidType`.
    pub fn unmarshal_cmd(&self, request: &Request) -> Result<BoxedCommand> {
        let info = self
            .method_info(&request.method)
            .ok_or_else(|| unregistered(&request.method))?;
        let num_params = request.params.len();
        check_num_params(num_params, &info)?;

        let mut object = Map::with_capacity(info.max_params);
        for (index, (param, field)) in request.params.iter().zip(&info.fields).enumerate() {
            let ty = field.ty.value_type();
            let optional_null = field.ty.is_optional() && param.is_null();
            if !optional_null && !ty.accepts(param) {
                return Err(Error::new(
                    ErrorKind::InvalidType,
                    format!(
                        "parameter #{} '{}' must be type {} (got {})",
                        index + 1,
                        field.name.to_lowercase(),
                        ty,
                        json_kind(param)
                    ),
                ));
            }
            object.insert(field.name.clone(), param.clone());
        }

        // Trailing parameters were omitted, so fill in stored defaults and
        // zero fills. Other optional fields stay absent.
        for index in num_params..info.max_params {
            if let Some(value) = info.omitted_value(index) {
                object.insert(info.fields[index].name.clone(), value.clone());
            }
        }

        (info.decode)(Value::Object(object))
            .map_err(|err| unmarshal_error(&info, &request.params, &err))
    }

    /// Decode a request into a [`ParsedRequest`], mapping codec failures
    /// onto wire errors.
    #[must_use]
    pub fn parse_cmd(&self, request: &Request) -> ParsedRequest {
        let cmd = self.unmarshal_cmd(request).map_err(|err| {
            tracing::debug!("Failed to decode {}: {}", request.method, err);
            RpcError::from(err)
        });
        ParsedRequest {
            id: request.id.clone(),
            method: request.method.clone(),
            cmd,
        }
    }
}

/// Name the first supplied parameter that fails to decode on its own, or
/// fall back to the decoder's message when none does.
fn unmarshal_error(info: &MethodInfo, params: &[Value], err: &serde_json::Error) -> Error {
    let culprit = params.iter().zip(&info.fields).position(|(param, field)| {
        let mut isolated = info.sample.clone();
        isolated.insert(field.name.clone(), param.clone());
        (info.decode)(Value::Object(isolated)).is_err()
    });
    let message = match culprit {
        Some(index) => format!(
            "parameter #{} '{}' failed to unmarshal: {err}",
            index + 1,
            info.fields[index].name.to_lowercase()
        ),
        None => format!("parameters failed to unmarshal: {err}"),
    };
    Error::new(ErrorKind::InvalidType, message)
}

fn check_num_params(num_params: usize, info: &MethodInfo) -> Result<()> {
    if num_params >= info.num_req_params && num_params <= info.max_params {
        return Ok(());
    }
    let message = if info.num_req_params == info.max_params {
        format!(
            "wrong number of params (expected {}, received {})",
            info.num_req_params, num_params
        )
    } else {
        format!(
            "wrong number of params (expected between {} and {}, received {})",
            info.num_req_params, info.max_params, num_params
        )
    };
    Err(Error::new(ErrorKind::WrongNumberOfParams, message))
}
