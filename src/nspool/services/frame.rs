/*
 * Copyright (C) 2025 The Nspool Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Wire framing on the daemon socket. A request is a 2-byte big-endian
//! service type, a length-prefixed method string, then a length-prefixed
//! JSON body; responses are a single length-prefixed JSON value. All length
//! prefixes are 4-byte big-endian.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};

use crate::nspool::util::error::{new_error, with_context, BoxError};

use super::ServiceType;

/// Upper bound on any framed payload; a corrupt prefix must not turn into a
/// giant allocation.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub fn send_service_type(conn: &mut impl Write, service: ServiceType) -> Result<(), BoxError> {
    conn.write_all(&service.to_be_bytes())
        .map_err(|e| with_context(e, "failed to send service type"))
}

/// Reads the next request's service type. `Err(UnexpectedEof)` at the frame
/// boundary means the client hung up cleanly.
pub fn receive_service_type(conn: &mut impl Read) -> io::Result<ServiceType> {
    let mut prefix = [0u8; 2];
    conn.read_exact(&mut prefix)?;
    Ok(ServiceType::from_be_bytes(prefix))
}

pub fn send_method(conn: &mut impl Write, method: &str) -> Result<(), BoxError> {
    send_frame(conn, method.as_bytes())
}

pub fn receive_method(conn: &mut impl Read) -> Result<String, BoxError> {
    let bytes = receive_frame(conn)?;
    String::from_utf8(bytes).map_err(|e| with_context(e, "method name is not valid utf-8"))
}

pub fn send_json<T: Serialize>(conn: &mut impl Write, value: &T) -> Result<(), BoxError> {
    let body = serde_json::to_vec(value).map_err(|e| with_context(e, "failed to encode body"))?;
    send_frame(conn, &body)
}

pub fn receive_json<T: DeserializeOwned>(conn: &mut impl Read) -> Result<T, BoxError> {
    let body = receive_frame(conn)?;
    serde_json::from_slice(&body).map_err(|e| with_context(e, "failed to decode body"))
}

fn send_frame(conn: &mut impl Write, body: &[u8]) -> Result<(), BoxError> {
    let len = u32::try_from(body.len()).map_err(|_| new_error("frame too large"))?;
    if len > MAX_FRAME_LEN {
        return Err(new_error("frame too large"));
    }
    conn.write_all(&len.to_be_bytes())
        .and_then(|()| conn.write_all(body))
        .map_err(|e| with_context(e, "failed to send frame"))?;
    Ok(())
}

fn receive_frame(conn: &mut impl Read) -> Result<Vec<u8>, BoxError> {
    let mut prefix = [0u8; 4];
    conn.read_exact(&mut prefix)
        .map_err(|e| with_context(e, "failed to read frame length"))?;
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(new_error(format!("frame of {} bytes is too large", len)));
    }
    let mut body = vec![0u8; len as usize];
    conn.read_exact(&mut body)
        .map_err(|e| with_context(e, "failed to read frame body"))?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nspool::api::namespace::GetNamespaceRequest;
    use crate::nspool::api::types::{NamespaceType, Reference};
    use std::io::Cursor;

    #[test]
    fn request_frames_round_trip() {
        let mut buffer = Vec::new();
        send_service_type(&mut buffer, super::super::NAMESPACE_SERVICE).unwrap();
        send_method(&mut buffer, "Get").unwrap();
        send_json(
            &mut buffer,
            &GetNamespaceRequest {
                ns_type: NamespaceType::Ipc,
                reference: Reference::new("checkpoint/app"),
                extra_refs: Vec::new(),
            },
        )
        .unwrap();

        let mut cursor = Cursor::new(buffer);
        assert_eq!(
            receive_service_type(&mut cursor).unwrap(),
            super::super::NAMESPACE_SERVICE
        );
        assert_eq!(receive_method(&mut cursor).unwrap(), "Get");
        let request: GetNamespaceRequest = receive_json(&mut cursor).unwrap();
        assert_eq!(request.ns_type, NamespaceType::Ipc);
        assert_eq!(request.reference.name, "checkpoint/app");
    }

    #[test]
    fn eof_at_the_frame_boundary_is_clean() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let err = receive_service_type(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut cursor = Cursor::new(buffer);
        let err = receive_frame(&mut cursor).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
