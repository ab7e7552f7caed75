mod dispatch;
mod reply;
