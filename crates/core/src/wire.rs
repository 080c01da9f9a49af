//! Mapping between call envelopes and transport [`Message`]s.
//!
//! Everything the pipeline needs travels in reserved header keys; call
//! metadata rides along under the `x-md-` prefix.

use plexus_transport::Message;

use crate::{Error, ErrorKind, Metadata, Request, Response, Result};

/// Correlates a response with its request.
pub const HEADER_REQUEST_ID: &str = "x-request-id";
/// Target service.
pub const HEADER_SERVICE: &str = "x-service";
/// Target endpoint.
pub const HEADER_ENDPOINT: &str = "x-endpoint";
/// Body encoding.
pub const HEADER_CONTENT_TYPE: &str = "content-type";
/// Present on requests that open a stream.
pub const HEADER_STREAM: &str = "x-stream";
/// Present on the last message of a stream.
pub const HEADER_END_OF_STREAM: &str = "x-end-of-stream";
/// Detail of a failed call.
pub const HEADER_ERROR: &str = "x-error";
/// [`ErrorKind`] of a failed call.
pub const HEADER_ERROR_KIND: &str = "x-error-kind";

const RESERVED: [&str; 8] = [
    HEADER_REQUEST_ID,
    HEADER_SERVICE,
    HEADER_ENDPOINT,
    HEADER_CONTENT_TYPE,
    HEADER_STREAM,
    HEADER_END_OF_STREAM,
    HEADER_ERROR,
    HEADER_ERROR_KIND,
];

/// Builds the message that carries `request`.
#[must_use]
pub fn encode_request(request_id: &str, metadata: &Metadata, request: &Request) -> Message {
    let mut message = Message::new(request.body.clone())
        .with_header(HEADER_REQUEST_ID, request_id)
        .with_header(HEADER_SERVICE, request.service.as_str())
        .with_header(HEADER_ENDPOINT, request.endpoint.as_str())
        .with_header(HEADER_CONTENT_TYPE, request.content_type.as_str());
    if request.stream {
        message.header.insert(HEADER_STREAM.to_string(), "true".to_string());
    }
    metadata.write_header(&mut message.header);
    message
}

/// Splits an inbound message into request id, metadata and request.
///
/// # Errors
///
/// [`Error::BadRequest`] when the endpoint header is missing.
pub fn decode_request(message: &Message) -> Result<(String, Metadata, Request)> {
    let header = |key: &str| message.header(key).unwrap_or_default().to_string();

    let endpoint = header(HEADER_ENDPOINT);
    if endpoint.is_empty() {
        return Err(Error::BadRequest("missing endpoint".to_string()));
    }

    let request_id = header(HEADER_REQUEST_ID);
    let metadata = Metadata::from_header(&message.header);
    let request = Request {
        service: header(HEADER_SERVICE),
        endpoint,
        content_type: header(HEADER_CONTENT_TYPE),
        body: message.body.clone(),
        stream: message.header(HEADER_STREAM).is_some(),
    };

    Ok((request_id, metadata, request))
}

/// Builds the reply for a handler outcome.
#[must_use]
pub fn encode_response(request_id: &str, result: Result<Response>) -> Message {
    match result {
        Ok(response) => {
            let mut message = Message::new(response.body);
            message.header = response.header;
            message
                .header
                .insert(HEADER_REQUEST_ID.to_string(), request_id.to_string());
            message
        }
        Err(err) => with_error(Message::new(bytes::Bytes::new()), &err)
            .with_header(HEADER_REQUEST_ID, request_id),
    }
}

/// Turns a reply into the handler's outcome.
///
/// # Errors
///
/// The remote error, rebuilt from the error headers.
pub fn decode_response(mut message: Message) -> Result<Response> {
    if let Some(err) = error_of(&message) {
        return Err(err);
    }
    for key in RESERVED {
        message.header.remove(key);
    }
    Ok(Response {
        header: message.header,
        body: message.body,
    })
}

/// One data message inside a stream.
#[must_use]
pub fn stream_message(request_id: &str, body: bytes::Bytes) -> Message {
    Message::new(body).with_header(HEADER_REQUEST_ID, request_id)
}

/// The final message of a stream, carrying the error if the stream failed.
#[must_use]
pub fn end_of_stream(request_id: &str, error: Option<&Error>) -> Message {
    let message = Message::new(bytes::Bytes::new())
        .with_header(HEADER_REQUEST_ID, request_id)
        .with_header(HEADER_END_OF_STREAM, "true");
    match error {
        Some(err) => with_error(message, err),
        None => message,
    }
}

/// Whether `message` ends a stream.
#[must_use]
pub fn is_end_of_stream(message: &Message) -> bool {
    message.header(HEADER_END_OF_STREAM).is_some()
}

/// The request id carried by `message`.
#[must_use]
pub fn request_id(message: &Message) -> Option<&str> {
    message.header(HEADER_REQUEST_ID)
}

/// The error carried by `message`, if any.
#[must_use]
pub fn error_of(message: &Message) -> Option<Error> {
    let kind = message.header(HEADER_ERROR_KIND)?;
    let detail = message.header(HEADER_ERROR).unwrap_or_default();
    Some(match kind.parse::<ErrorKind>() {
        Ok(kind) => Error::from_wire(kind, detail),
        Err(_) => Error::InternalServer(detail.to_string()),
    })
}

fn with_error(message: Message, err: &Error) -> Message {
    message
        .with_header(HEADER_ERROR_KIND, err.kind().as_str())
        .with_header(HEADER_ERROR, err.detail())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope() {
        let metadata: Metadata = [("user", "alice")].into_iter().collect();
        let request = Request::new("greeter", "hello", "application/cbor", "payload");

        let message = encode_request("req-1", &metadata, &request);
        let (request_id, decoded_metadata, decoded) = decode_request(&message).unwrap();

        assert_eq!(request_id, "req-1");
        assert_eq!(decoded_metadata, metadata);
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_missing_endpoint_is_bad_request() {
        let result = decode_request(&Message::new("payload"));
        assert!(matches!(result, Err(Error::BadRequest(_))));
    }

    #[test]
    fn test_error_response_is_rebuilt() {
        let message = encode_response("req-2", Err(Error::NotFound("endpoint nope".to_string())));

        assert_eq!(request_id(&message), Some("req-2"));
        assert_eq!(
            decode_response(message),
            Err(Error::NotFound("endpoint nope".to_string()))
        );
    }

    #[test]
    fn test_response_header_strips_reserved_keys() {
        let mut response = Response::new("ok");
        response
            .header
            .insert("x-served-by".to_string(), "node-1".to_string());

        let decoded = decode_response(encode_response("req-3", Ok(response.clone()))).unwrap();

        assert_eq!(decoded, response);
    }

    #[test]
    fn test_end_of_stream_with_error() {
        let message = end_of_stream("req-4", Some(&Error::ServerStopping));

        assert!(is_end_of_stream(&message));
        assert_eq!(error_of(&message), Some(Error::ServerStopping));
        assert!(!is_end_of_stream(&stream_message("req-4", "data".into())));
    }
}
