pub mod health_handlers;
pub mod story_handlers;
