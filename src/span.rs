use actix::prelude::*;
use tracing::Span;

/// Message with span used for trace logging
pub struct SpanMessage<I> {
    pub msg: I,
    pub span: Span,
}

impl<M> SpanMessage<M> {
    pub fn new(msg: M) -> Self {
        Self {
            msg,
            span: Span::current(),
        }
    }
}

impl<M, R: 'static> Message for SpanMessage<M>
where
    M: Message<Result = R>,
{
    type Result = R;
}

/// Lets an actor accept `SpanMessage<M>` for every `M` it already handles.
/// The sender's span is entered while the inner handler runs.
#[macro_export]
macro_rules! span_message_impl {
    ($message_type:ty, $actor:ty) => {
        impl actix::Handler<$crate::span::SpanMessage<$message_type>> for $actor {
            type Result = <$actor as actix::Handler<$message_type>>::Result;

            fn handle(
                &mut self,
                msg: $crate::span::SpanMessage<$message_type>,
                ctx: &mut <$actor as actix::Actor>::Context,
            ) -> Self::Result {
                let $crate::span::SpanMessage { msg, span } = msg;
                let _enter = span.enter();
                tracing::trace!("Running wrapped span message handler");
                <$actor as actix::Handler<$message_type>>::handle(self, msg, ctx)
            }
        }
    };
}
