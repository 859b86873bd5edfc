use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::storage::{Item, ItemKey, KvError};

/// Sort key value of primary user records.
pub const USER_KIND: &str = "UserInfo";
/// Sort key value of email reservation records.
pub const EMAIL_KIND: &str = "UserInfo#email";

pub(crate) const EMAIL_ATTR: &str = "Email";
const NAME_ATTR: &str = "Name";
const CREDENTIAL_ATTR: &str = "Credential";
const LAST_LOGIN_ATTR: &str = "LastLogin";
const USER_ID_ATTR: &str = "UserId";

/// User record in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,                 // opaque, immutable once created
    pub email: String,              // unique across all users
    pub name: String,               // display name
    pub credential: String,         // argon2 hash, never sent to clients
    pub last_login: Option<OffsetDateTime>,
}

impl User {
    pub fn key_for(id: &str) -> ItemKey {
        ItemKey::new(id, USER_KIND)
    }

    pub fn key(&self) -> ItemKey {
        Self::key_for(&self.id)
    }

    /// The email reservation that must accompany this record.
    pub fn email_index(&self) -> EmailIndex {
        EmailIndex {
            email: self.email.clone(),
            user_id: self.id.clone(),
        }
    }

    pub fn to_item(&self) -> Result<Item, KvError> {
        let mut item = Item::new(self.key())
            .with(EMAIL_ATTR, &self.email)
            .with(NAME_ATTR, &self.name)
            .with(CREDENTIAL_ATTR, &self.credential);
        if let Some(at) = self.last_login {
            let stamp = at
                .format(&Rfc3339)
                .map_err(|e| KvError::Malformed(format!("last login: {e}")))?;
            item = item.with(LAST_LOGIN_ATTR, stamp);
        }
        Ok(item)
    }

    pub fn from_item(item: &Item) -> Result<Self, KvError> {
        if item.key.kind != USER_KIND {
            return Err(KvError::Malformed(format!(
                "expected a {USER_KIND} record, got {}",
                item.key
            )));
        }
        let last_login = item
            .attr(LAST_LOGIN_ATTR)
            .map(|stamp| OffsetDateTime::parse(stamp, &Rfc3339))
            .transpose()
            .map_err(|e| KvError::Malformed(format!("last login: {e}")))?;
        Ok(Self {
            id: item.key.id.clone(),
            email: item.attr(EMAIL_ATTR).unwrap_or_default().to_string(),
            name: item.attr(NAME_ATTR).unwrap_or_default().to_string(),
            credential: item.attr(CREDENTIAL_ATTR).unwrap_or_default().to_string(),
            last_login,
        })
    }
}

/// Reservation of one email value, keyed by the email itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailIndex {
    pub email: String,
    pub user_id: String,
}

impl EmailIndex {
    pub fn key_for(email: &str) -> ItemKey {
        ItemKey::new(email, EMAIL_KIND)
    }

    pub fn to_item(&self) -> Item {
        Item::new(Self::key_for(&self.email)).with(USER_ID_ATTR, &self.user_id)
    }

    /// `None` when the record carries no usable owner id.
    pub fn from_item(item: &Item) -> Option<Self> {
        let user_id = item.attr(USER_ID_ATTR).filter(|id| !id.is_empty())?;
        Some(Self {
            email: item.key.id.clone(),
            user_id: user_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample() -> User {
        User {
            id: "u-1".into(),
            email: "ada@example.com".into(),
            name: "Ada".into(),
            credential: "$argon2id$hash".into(),
            last_login: Some(datetime!(2024-03-01 12:30:45.123456789 UTC)),
        }
    }

    #[test]
    fn user_item_keeps_every_field() {
        let user = sample();
        let item = user.to_item().expect("encode");
        assert_eq!(item.key, ItemKey::new("u-1", USER_KIND));
        assert_eq!(item.attr(EMAIL_ATTR), Some("ada@example.com"));
        assert_eq!(User::from_item(&item).expect("decode"), user);
    }

    #[test]
    fn never_logged_in_has_no_last_login_attribute() {
        let user = User {
            last_login: None,
            ..sample()
        };
        let item = user.to_item().unwrap();
        assert!(item.attr(LAST_LOGIN_ATTR).is_none());
        assert_eq!(User::from_item(&item).unwrap().last_login, None);
    }

    #[test]
    fn index_record_is_not_a_user() {
        let index = sample().email_index().to_item();
        assert_eq!(index.key, ItemKey::new("ada@example.com", EMAIL_KIND));
        assert!(matches!(User::from_item(&index), Err(KvError::Malformed(_))));
    }

    #[test]
    fn bad_timestamp_is_malformed() {
        let item = sample().to_item().unwrap().with(LAST_LOGIN_ATTR, "yesterday");
        assert!(matches!(User::from_item(&item), Err(KvError::Malformed(_))));
    }

    #[test]
    fn index_without_owner_is_unusable() {
        let item = Item::new(EmailIndex::key_for("ada@example.com"));
        assert!(EmailIndex::from_item(&item).is_none());
        let item = item.with(USER_ID_ATTR, "u-1");
        assert_eq!(
            EmailIndex::from_item(&item),
            Some(EmailIndex {
                email: "ada@example.com".into(),
                user_id: "u-1".into(),
            })
        );
    }
}
