//! Restricts `audio_files` to its uploader. Creating stays open to any
//! authenticated account, including on behalf of another uploader.

use super::m1760987714_created_audio_files::AUDIO_FILES_ID;
use super::Migration;
use crate::error::ApiResult;
use crate::rule::Operation;
use crate::store::{Database, SchemaDao};

const UPLOADER_ONLY: &str = "@request.auth.id = uploader_id";
const AUTHENTICATED: &str = "@request.auth.id != \"\"";

pub fn migration() -> Migration {
    Migration {
        key: 1760987767,
        name: "1760987767_updated_audio_files",
        up,
        down,
    }
}

fn up(db: &mut Database) -> ApiResult<()> {
    let mut collection = db.find_collection_by_name_or_id(AUDIO_FILES_ID)?;
    collection.set_all_rules(Some(UPLOADER_ONLY));
    collection.set_rule(Operation::Create, Some(AUTHENTICATED));
    db.save_collection(collection)
}

fn down(db: &mut Database) -> ApiResult<()> {
    let mut collection = db.find_collection_by_name_or_id(AUDIO_FILES_ID)?;
    collection.set_all_rules(None);
    db.save_collection(collection)
}
