//! Data models for vocabdeck entities.
//!
//! This module contains the data structures exchanged with the
//! vocabulary server:
//!
//! - `User` and the login/register request and response types
//! - `Vocabulary`, `VocabularyRequest`: flashcard entries
//! - `Page`: the server's paginated list wrapper

pub mod user;
pub mod vocabulary;

pub use user::{AuthResponse, LoginRequest, RegisterRequest, User};
pub use vocabulary::{Page, Vocabulary, VocabularyPage, VocabularyRequest};
