mod posts;
mod proxies;
mod schema;
mod sources;
mod tags;
mod types;

pub use schema::Database;
pub use types::{
    Category, Enclosure, NewEnclosure, NewPost, Post, Source, StorageError, Tag, WebProxy,
};
