use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
enum Participants {
    Table,
    ConversationId,
    UserId,
    LastReadAt,
    JoinedAt,
}

#[derive(DeriveIden)]
enum Conversations {
    Table,
    Id,
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250301_000002_create_participants_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Participants::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Participants::ConversationId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Participants::UserId).string().not_null())
                    .col(ColumnDef::new(Participants::LastReadAt).big_integer())
                    .col(
                        ColumnDef::new(Participants::JoinedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(Participants::ConversationId)
                            .col(Participants::UserId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_participants_conversation")
                            .from(Participants::Table, Participants::ConversationId)
                            .to(Conversations::Table, Conversations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Membership lookups go by user
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_participants_user")
                    .table(Participants::Table)
                    .col(Participants::UserId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Participants::Table).to_owned())
            .await
    }
}
