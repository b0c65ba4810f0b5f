//! Opens the users collection to every authenticated account.

use super::Migration;
use crate::error::ApiResult;
use crate::rule::Operation;
use crate::schema::{AuthOptions, CollectionOptions, USERS_COLLECTION_ID};
use crate::store::{Database, SchemaDao};

const AUTHENTICATED: &str = "@request.auth.id != \"\"";
const SELF_ONLY: &str = "id = @request.auth.id";

pub fn migration() -> Migration {
    Migration {
        key: 1760987154,
        name: "1760987154_updated_users",
        up,
        down,
    }
}

fn options(manage_rule: Option<&str>) -> CollectionOptions {
    CollectionOptions::Auth(AuthOptions {
        allow_email_auth: true,
        allow_oauth2_auth: true,
        allow_username_auth: true,
        except_email_domains: None,
        manage_rule: manage_rule.map(String::from),
        min_password_length: 8,
        only_email_domains: None,
        only_verified: false,
        require_email: false,
    })
}

fn up(db: &mut Database) -> ApiResult<()> {
    let mut collection = db.find_collection_by_name_or_id(USERS_COLLECTION_ID)?;
    collection.set_all_rules(Some(AUTHENTICATED));
    collection.options = options(Some(AUTHENTICATED));
    db.save_collection(collection)
}

fn down(db: &mut Database) -> ApiResult<()> {
    let mut collection = db.find_collection_by_name_or_id(USERS_COLLECTION_ID)?;
    collection.set_all_rules(Some(SELF_ONLY));
    collection.set_rule(Operation::Create, Some(""));
    collection.options = options(None);
    db.save_collection(collection)
}
