//! Request correlation and spans.
//!
//! # Responsibilities
//! - Extract or generate an `x-request-id` for inbound calls
//! - Echo it on the reply header
//! - Propagate the inbound id to outbound calls made while serving it
//! - Run every call inside a span carrying side, kind, operation and id

use tracing::Instrument;
use uuid::Uuid;

use crate::context::Context;
use crate::middleware::{Handler, Middleware};
use crate::transport::Side;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id of the inbound call `ctx` belongs to, if any.
pub fn request_id(ctx: &Context) -> Option<String> {
    ctx.server_transport()
        .and_then(|tr| tr.request_header().get(REQUEST_ID_HEADER))
}

/// Span middleware for inbound calls.
pub fn server<Req, Resp>() -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    Middleware::new(|next: Handler<Req, Resp>| {
        Handler::new(move |ctx: Context, req: Req| {
            let next = next.clone();
            let (kind, operation, id) = match ctx.server_transport() {
                Some(tr) => {
                    let id = tr
                        .request_header()
                        .get(REQUEST_ID_HEADER)
                        .unwrap_or_else(|| Uuid::new_v4().to_string());
                    // Later middlewares and the handler read it from the request header.
                    tr.request_header().set(REQUEST_ID_HEADER, &id);
                    tr.reply_header().set(REQUEST_ID_HEADER, &id);
                    (tr.kind().to_string(), tr.operation().to_string(), id)
                }
                None => (String::new(), String::new(), Uuid::new_v4().to_string()),
            };
            let span = tracing::info_span!(
                "call",
                side = %Side::Server,
                kind = %kind,
                operation = %operation,
                request_id = %id,
            );
            async move { next.call(ctx, req).await }.instrument(span)
        })
    })
}

/// Span middleware for outbound calls.
pub fn client<Req, Resp>() -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    Middleware::new(|next: Handler<Req, Resp>| {
        Handler::new(move |ctx: Context, req: Req| {
            let next = next.clone();
            let inbound = request_id(&ctx);
            let (kind, operation, id) = match ctx.client_transport() {
                Some(tr) => {
                    let header = tr.request_header();
                    let id = header.get(REQUEST_ID_HEADER).or(inbound);
                    if let Some(id) = &id {
                        header.set(REQUEST_ID_HEADER, id);
                    }
                    (tr.kind().to_string(), tr.operation().to_string(), id)
                }
                None => (String::new(), String::new(), inbound),
            };
            let span = tracing::info_span!(
                "call",
                side = %Side::Client,
                kind = %kind,
                operation = %operation,
                request_id = id.as_deref().unwrap_or(""),
            );
            async move { next.call(ctx, req).await }.instrument(span)
        })
    })
}
