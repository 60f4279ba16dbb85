use crate::protocol::{Presence, PresenceEvent};

/// A participant as shown in the room, one per user however many
/// connections they hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomUser {
    pub id: String,
    pub name: String,
    pub image: String,
}

/// Collapse presence entries to one user per `user_id`, in first-seen order.
/// A later entry for the same user refreshes its name and image.
pub fn room_users(presences: &[Presence]) -> Vec<RoomUser> {
    let mut users: Vec<RoomUser> = Vec::with_capacity(presences.len());
    for presence in presences {
        let user = RoomUser {
            id: presence.user_id.clone(),
            name: presence.user_name.clone(),
            image: presence.user_image.clone(),
        };
        match users.iter_mut().find(|existing| existing.id == user.id) {
            Some(existing) => *existing = user,
            None => users.push(user),
        }
    }
    users
}

/// Users currently in the room, rebuilt from every presence snapshot
#[derive(Debug, Default)]
pub struct Roster {
    users: Vec<RoomUser>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: PresenceEvent, presences: &[Presence]) {
        self.users = room_users(presences);
        tracing::debug!("Presence {:?}: {} user(s) in room", event, self.users.len());
    }

    pub fn users(&self) -> &[RoomUser] {
        &self.users
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn presence(user_id: &str, name: &str) -> Presence {
        Presence {
            presence_ref: Uuid::new_v4(),
            user_id: user_id.to_string(),
            user_name: name.to_string(),
            user_image: format!("https://img.example/{user_id}.png"),
            online_at: 0,
        }
    }

    #[test]
    fn dedupes_by_user_id() {
        let users = room_users(&[
            presence("u1", "Ada"),
            presence("u2", "Grace"),
            presence("u1", "Ada (laptop)"),
        ]);
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].id, "u1");
        assert_eq!(users[0].name, "Ada (laptop)");
        assert_eq!(users[1].name, "Grace");
    }

    #[test]
    fn roster_follows_latest_snapshot() {
        let mut roster = Roster::new();
        roster.apply(
            PresenceEvent::Join,
            &[presence("u1", "Ada"), presence("u2", "Grace")],
        );
        assert_eq!(roster.users().len(), 2);

        roster.apply(PresenceEvent::Leave, &[presence("u2", "Grace")]);
        assert_eq!(
            roster.users(),
            &[RoomUser {
                id: "u2".to_string(),
                name: "Grace".to_string(),
                image: "https://img.example/u2.png".to_string(),
            }]
        );

        roster.apply(PresenceEvent::Sync, &[]);
        assert!(roster.users().is_empty());
    }
}
