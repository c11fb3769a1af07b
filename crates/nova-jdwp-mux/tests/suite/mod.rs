mod dispatch;
mod lifecycle;
mod pipeline;
mod registry;
