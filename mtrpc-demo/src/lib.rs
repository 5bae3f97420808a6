use mtrpc::{
    Error, ErrorKind, MethodDescriptor, RequestStream, ResponseSink, Result, Router,
};
use serde::{Deserialize, Serialize};

pub mod certs;

pub const SEARCH: &str = "SearchService/Search";
pub const LIST: &str = "StreamService/List";
pub const RECORD: &str = "StreamService/Record";
pub const ROUTE: &str = "StreamService/Route";

/// Responses sent by `List` for one request.
pub const LIST_LEN: i32 = 7;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub request: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub response: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamPoint {
    pub name: String,
    pub value: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub pt: StreamPoint,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamResponse {
    pub pt: StreamPoint,
}

impl StreamRequest {
    pub fn new(name: impl Into<String>, value: i32) -> Self {
        Self {
            pt: StreamPoint {
                name: name.into(),
                value,
            },
        }
    }
}

/// Registers the search and stream demo services.
///
/// # Errors
///
/// Returns `DuplicateMethod` if `router` already serves one of them.
pub fn register(router: &mut Router) -> Result<()> {
    router.register(MethodDescriptor::unary(
        SEARCH,
        |_ctx, req: SearchRequest| async move {
            Ok(SearchResponse {
                response: format!("{} Server", req.request),
            })
        },
    ))?;

    router.register(MethodDescriptor::server_stream(
        LIST,
        |_ctx, req: StreamRequest, sink: ResponseSink<StreamResponse>| async move {
            for n in 0..LIST_LEN {
                let value = req.pt.value.checked_add(n).ok_or_else(|| {
                    Error::new(ErrorKind::InvalidArgument, "point value overflows")
                })?;
                sink.send(&StreamResponse {
                    pt: StreamPoint {
                        name: req.pt.name.clone(),
                        value,
                    },
                })
                .await?;
            }
            Ok(())
        },
    ))?;

    router.register(MethodDescriptor::client_stream(
        RECORD,
        |_ctx, mut reqs: RequestStream<StreamRequest>| async move {
            let mut name = String::new();
            let mut sum = 0i32;
            while let Some(req) = reqs.recv().await? {
                sum = sum.checked_add(req.pt.value).ok_or_else(|| {
                    Error::new(ErrorKind::InvalidArgument, "recorded sum overflows")
                })?;
                name = req.pt.name;
            }
            Ok(StreamResponse {
                pt: StreamPoint { name, value: sum },
            })
        },
    ))?;

    router.register(MethodDescriptor::bidi_stream(
        ROUTE,
        |_ctx,
         mut reqs: RequestStream<StreamRequest>,
         sink: ResponseSink<StreamResponse>| async move {
            while let Some(req) = reqs.recv().await? {
                let StreamPoint { name, value } = req.pt;
                sink.send(&StreamResponse {
                    pt: StreamPoint {
                        name,
                        value: value.wrapping_add(1),
                    },
                })
                .await?;
            }
            Ok(())
        },
    ))?;

    Ok(())
}
