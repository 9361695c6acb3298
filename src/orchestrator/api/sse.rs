use crate::normalized::RunEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;

/// One SSE frame per event: the event name, then its JSON payload.
pub fn to_sse_event(event: &RunEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.payload().to_string())
}

pub fn build_sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send>
where
    S: Stream<Item = RunEvent> + Send + 'static,
{
    let stream = stream.map(|event| Ok(to_sse_event(&event)));

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
