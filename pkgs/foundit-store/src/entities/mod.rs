//! Sea-ORM entities for foundit-store

pub mod conversations;
pub mod messages;
pub mod participants;
pub mod profiles;
pub mod reactions;

pub use conversations::Entity as Conversation;
pub use messages::Entity as Message;
pub use participants::Entity as Participant;
pub use profiles::Entity as Profile;
pub use reactions::Entity as Reaction;
