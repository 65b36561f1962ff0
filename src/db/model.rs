//! Inputs accepted by repositories.
//!
//! Keep these structs focused on the data written by queries. Business logic
//! lives in `pipeline` and `sweep`.

use crate::model::ImageSource;

/// A spirit row to insert. Catalogue import lives outside this crate; this
/// is used for seeding local databases.
#[derive(Debug, Clone, Default)]
pub struct NewSpirit {
    pub id: String,
    pub name: String,
    pub brand: String,
    pub category: Option<String>,
    pub image_url: Option<String>,
}

/// Everything needed to link a re-hosted image to its spirit.
#[derive(Debug, Clone)]
pub struct ImageLink {
    pub spirit_id: String,
    /// Public URL inside the bucket.
    pub hosted_url: String,
    pub source_url: String,
    pub source: ImageSource,
    pub attribution: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}
