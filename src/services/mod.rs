pub mod story_service;
