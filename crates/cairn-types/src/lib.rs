pub mod blob_id;
pub mod content_id;
pub mod manifest_id;
pub mod object_id;
