//! Creates the `audio_files` collection, every rule locked.
//!
//! Reverting deletes the collection together with all of its rows and
//! attachments.

use super::Migration;
use crate::error::ApiResult;
use crate::schema::{
    Collection, FieldKind, FileOptions, RelationOptions, SchemaField, SelectOptions, TextOptions,
    DEFAULT_MAX_FILE_SIZE, USERS_COLLECTION_ID,
};
use crate::store::{Database, SchemaDao};

pub const AUDIO_FILES_ID: &str = "wbzryti42j4f1bz";

pub const CATEGORIES: [&str; 5] = ["Music", "Podcast", "Audiobook", "Lecture", "Others"];

pub const AUDIO_MIME_TYPES: [&str; 3] = ["audio/mp4", "audio/mpeg", "video/x-msvideo"];

pub fn migration() -> Migration {
    Migration {
        key: 1760987714,
        name: "1760987714_created_audio_files",
        up,
        down,
    }
}

fn audio_files() -> Collection {
    let mut collection = Collection::new_base(AUDIO_FILES_ID, "audio_files");
    collection.created = "2025-10-20 19:15:14.292Z".to_string();
    collection.updated = "2025-10-20 19:15:14.292Z".to_string();
    collection.schema = vec![
        SchemaField::new(
            "xndqtwvh",
            "uploader_id",
            FieldKind::Relation(RelationOptions {
                collection_id: USERS_COLLECTION_ID.to_string(),
                cascade_delete: false,
                min_select: None,
                max_select: Some(1),
                display_fields: None,
            }),
        ),
        SchemaField::new(
            "ymo8qywp",
            "description",
            FieldKind::Text(TextOptions {
                min: None,
                max: None,
                pattern: String::new(),
            }),
        ),
        SchemaField::new(
            "uiukasyq",
            "category",
            FieldKind::Select(SelectOptions {
                max_select: 1,
                values: CATEGORIES.iter().map(|c| c.to_string()).collect(),
            }),
        ),
        SchemaField::new(
            "ezj48rnq",
            "file",
            FieldKind::File(FileOptions {
                mime_types: AUDIO_MIME_TYPES.iter().map(|m| m.to_string()).collect(),
                thumbs: Vec::new(),
                max_select: 1,
                max_size: DEFAULT_MAX_FILE_SIZE,
                protected: false,
            }),
        ),
    ];
    collection
}

fn up(db: &mut Database) -> ApiResult<()> {
    db.save_collection(audio_files())
}

fn down(db: &mut Database) -> ApiResult<()> {
    let collection = db.find_collection_by_name_or_id(AUDIO_FILES_ID)?;
    db.delete_collection(&collection)
}
