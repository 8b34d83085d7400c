//! Fixed REST paths, relative to the configured base URL.

pub const LOGIN: &str = "/api/auth/login";
pub const REGISTER: &str = "/api/auth/register";
pub const VOCABULARY: &str = "/api/vocabulary";

pub fn vocabulary_item_path(id: i64) -> String {
    format!("{}/{}", VOCABULARY, id)
}
