//! Profile manager for identity display profiles

use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};
use tracing::debug;

use crate::entities::profiles;
use crate::rows::ProfileRow;

/// Profile manager
pub struct ProfileManager {
    db: DatabaseConnection,
}

impl ProfileManager {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Add or update a profile
    pub async fn upsert(&self, profile: &ProfileRow) -> Result<profiles::Model, DbErr> {
        let model = profiles::Model {
            user_id: profile.user_id.clone(),
            display_name: profile.display_name.clone(),
            avatar_url: profile.avatar_url.clone(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        };

        profiles::Entity::insert(profiles::ActiveModel::from(model.clone()))
            .on_conflict(
                OnConflict::column(profiles::Column::UserId)
                    .update_columns([
                        profiles::Column::DisplayName,
                        profiles::Column::AvatarUrl,
                        profiles::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        debug!("Saved profile: {} ({})", profile.display_name, profile.user_id);
        Ok(model)
    }

    /// Batch fetch profiles in one query
    pub async fn get_many(&self, user_ids: &[String]) -> Result<Vec<profiles::Model>, DbErr> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        profiles::Entity::find()
            .filter(profiles::Column::UserId.is_in(user_ids.to_vec()))
            .all(&self.db)
            .await
    }
}
