use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::events::AskEvent;
use crate::pipeline::{self, AskRequest};
use crate::state::AppState;

/// The question endpoint. The pipeline runs in a background task and the
/// handler forwards its events to the client as they arrive; nothing is
/// buffered ahead of the first token.
pub async fn ask(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AskRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<AskEvent>(64);
    tokio::spawn(pipeline::run(state, request, tx));

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok(Event::default()
            .event(event.name())
            .data(event.payload().to_string()))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
