//! Link and camera state machines.
//!
//! [`LinkState`] is the single source of truth for "who is driving the bot".
//! It is deliberately dumb: transitions validate and mutate, nothing else.
//! Side effects (packet rebinding, ghost despawn, bot-logic start/stop) belong
//! to the splice core, which re-reads this state freshly after every await
//! rather than trusting a value captured earlier.

/// Identifies a downstream client connection.
pub type ClientId = u64;

/// Exactly one downstream client may be linked to the upstream at a time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Unlinked,
    Linked {
        client: ClientId,
    },
}

impl LinkState {
    pub fn is_linked(&self) -> bool {
        matches!(self, LinkState::Linked { .. })
    }

    /// The currently linked client, if any.
    pub fn controller(&self) -> Option<ClientId> {
        match self {
            LinkState::Linked { client } => Some(*client),
            LinkState::Unlinked => None,
        }
    }

    /// `Unlinked -> Linked(client)`. Linking is a user-facing command, so a
    /// refused transition is a [`LinkDenied`] message, never a panic, and the
    /// state is left untouched.
    pub fn try_link(&mut self, client: ClientId) -> Result<(), LinkDenied> {
        match *self {
            LinkState::Unlinked => {
                *self = LinkState::Linked { client };
                Ok(())
            }
            LinkState::Linked { client: current } if current == client => {
                Err(LinkDenied::AlreadyController)
            }
            LinkState::Linked { .. } => Err(LinkDenied::OtherController),
        }
    }

    /// `Linked -> Unlinked`. With `Some(client)` the caller must be the
    /// current controller; `None` is the programmatic/forced form (remote
    /// disconnect) and skips that check. Returns the client that was unlinked.
    pub fn try_unlink(&mut self, client: Option<ClientId>) -> Result<Option<ClientId>, LinkDenied> {
        match (*self, client) {
            (LinkState::Unlinked, None) => Ok(None),
            (LinkState::Unlinked, Some(_)) => Err(LinkDenied::NotLinked),
            (LinkState::Linked { client: current }, Some(caller)) if current != caller => {
                Err(LinkDenied::NotController)
            }
            (LinkState::Linked { client: current }, _) => {
                *self = LinkState::Unlinked;
                Ok(Some(current))
            }
        }
    }
}

/// Why a link/unlink transition was refused. Surfaced to the requesting
/// client as chat, never thrown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkDenied {
    AlreadyController,
    OtherController,
    NotController,
    NotLinked,
    NotAuthorized,
}

impl LinkDenied {
    pub fn message(&self) -> &'static str {
        match self {
            LinkDenied::AlreadyController => "Already in control, cannot link!",
            LinkDenied::OtherController => "Another client is in control, cannot link!",
            LinkDenied::NotController => "Not in control, cannot unlink!",
            LinkDenied::NotLinked => "Not linked, cannot unlink!",
            LinkDenied::NotAuthorized => "Not authorized to control this account!",
        }
    }
}

/// What a non-controlling observer's camera is doing.
///
/// `Spectator` is the resting state: free-flying, ghost subscribed. `BotPov`
/// pins the client-side camera to the ghost entity. `Controlling` exists only
/// for the single linked client, which sees the world through the bot's own
/// session and has the ghost despawned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CameraMode {
    #[default]
    Spectator,
    BotPov,
    Controlling,
}
