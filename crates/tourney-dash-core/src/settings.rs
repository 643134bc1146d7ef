// Shared settings object exchanged between the dashboard and the overlay.
//
// The relay treats a `SettingsState` as one opaque unit: it validates the
// shape, stores it, and republishes it. The mutation helpers further down are
// what the dashboard calls (through the sync agent's `update_state`) before a
// new snapshot is sent.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::ProtocolError;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Scene currently shown by the overlay. Closed set; anything else on the
/// wire is rejected during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Screen {
    Start,
    Standby,
    Versus,
    Mappool,
    Scheduling,
    Winner,
    Showcase,
    Seeding,
}

impl Screen {
    pub const ALL: [Screen; 8] = [
        Screen::Start,
        Screen::Standby,
        Screen::Versus,
        Screen::Mappool,
        Screen::Scheduling,
        Screen::Winner,
        Screen::Showcase,
        Screen::Seeding,
    ];
}

/// One of the two player slots of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerSlot {
    Player1,
    Player2,
}

impl PlayerSlot {
    pub const ALL: [PlayerSlot; 2] = [PlayerSlot::Player1, PlayerSlot::Player2];

    /// The opposing slot.
    pub fn other(self) -> PlayerSlot {
        match self {
            PlayerSlot::Player1 => PlayerSlot::Player2,
            PlayerSlot::Player2 => PlayerSlot::Player1,
        }
    }
}

/// Which of a player's two map sequences an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionKind {
    Pick,
    Ban,
}

impl SelectionKind {
    pub const ALL: [SelectionKind; 2] = [SelectionKind::Pick, SelectionKind::Ban];
}

// ---------------------------------------------------------------------------
// Settings object
// ---------------------------------------------------------------------------

/// Ordered map picks and bans of one player slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSelections {
    pub bans: Vec<String>,
    pub picks: Vec<String>,
}

impl PlayerSelections {
    pub fn list(&self, kind: SelectionKind) -> &[String] {
        match kind {
            SelectionKind::Pick => &self.picks,
            SelectionKind::Ban => &self.bans,
        }
    }

    fn list_mut(&mut self, kind: SelectionKind) -> &mut Vec<String> {
        match kind {
            SelectionKind::Pick => &mut self.picks,
            SelectionKind::Ban => &mut self.bans,
        }
    }

    pub fn contains(&self, kind: SelectionKind, map: &str) -> bool {
        self.list(kind).iter().any(|m| m == map)
    }
}

/// The single shared truth synchronized through the relay.
///
/// Serialized with camelCase keys. Unknown keys are kept in `extra` so that
/// newer clients can add scene fields without the relay stripping them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsState {
    /// Currently selected match; 0 means no match selected yet.
    pub match_id: u64,
    pub automatic_select: bool,
    pub active_screen: Screen,
    /// Screen shown before `active_screen`, used for transition direction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_screen: Option<Screen>,
    pub active_player: PlayerSlot,
    pub player1: PlayerSelections,
    pub player2: PlayerSelections,
    #[serde(default)]
    pub last_picked_by: Option<PlayerSlot>,
    /// Absolute instant the countdown runs to, as epoch milliseconds on the wire.
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub countdown: Option<DateTime<Utc>>,
    #[serde(default = "default_show_countdown")]
    pub show_countdown: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seeding_team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub showcase_beatmap: Option<String>,
    #[serde(default)]
    pub showcase_playing: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_show_countdown() -> bool {
    true
}

impl Default for SettingsState {
    fn default() -> Self {
        SettingsState {
            match_id: 0,
            automatic_select: false,
            active_screen: Screen::Start,
            previous_screen: None,
            active_player: PlayerSlot::Player1,
            player1: PlayerSelections::default(),
            player2: PlayerSelections::default(),
            last_picked_by: None,
            countdown: None,
            show_countdown: true,
            seeding_team: None,
            showcase_beatmap: None,
            showcase_playing: false,
            extra: Map::new(),
        }
    }
}

impl SettingsState {
    pub fn selections(&self, slot: PlayerSlot) -> &PlayerSelections {
        match slot {
            PlayerSlot::Player1 => &self.player1,
            PlayerSlot::Player2 => &self.player2,
        }
    }

    fn selections_mut(&mut self, slot: PlayerSlot) -> &mut PlayerSelections {
        match slot {
            PlayerSlot::Player1 => &mut self.player1,
            PlayerSlot::Player2 => &mut self.player2,
        }
    }

    /// Verify that no map appears twice across the four pick/ban sequences
    /// (including twice within the same sequence).
    pub fn check_invariants(&self) -> Result<(), ProtocolError> {
        let mut seen: HashMap<&str, (PlayerSlot, SelectionKind)> = HashMap::new();
        for slot in PlayerSlot::ALL {
            for kind in SelectionKind::ALL {
                for map in self.selections(slot).list(kind) {
                    if let Some((first_slot, first_kind)) = seen.insert(map.as_str(), (slot, kind)) {
                        return Err(ProtocolError::Invariant(format!(
                            "map `{map}` appears in {first_slot:?} {first_kind:?} and {slot:?} {kind:?}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dashboard mutations
    // -----------------------------------------------------------------------

    /// Confirm a pick or ban of `map` for the active player.
    ///
    /// Toggles: a map already in the active player's `kind` sequence is
    /// removed from it. Otherwise the map is removed from every sequence and
    /// appended to the active player's one. Either way the turn passes to the
    /// other player and `last_picked_by` is updated; tiebreaker maps (`TB`)
    /// are not attributed to anyone.
    pub fn confirm_selection(&mut self, kind: SelectionKind, map: &str) {
        let active = self.active_player;

        if self.selections(active).contains(kind, map) {
            self.selections_mut(active)
                .list_mut(kind)
                .retain(|m| m != map);
        } else {
            for slot in PlayerSlot::ALL {
                for k in SelectionKind::ALL {
                    self.selections_mut(slot).list_mut(k).retain(|m| m != map);
                }
            }
            self.selections_mut(active).list_mut(kind).push(map.to_string());
        }

        self.last_picked_by = if map.contains("TB") { None } else { Some(active) };
        self.active_player = active.other();
    }

    /// Switch the overlay to `screen`.
    ///
    /// A countdown that already ran out is hidden on any screen switch.
    /// `previous_screen` only moves when the screen actually changes.
    pub fn set_active_screen(&mut self, screen: Screen, now: DateTime<Utc>) {
        if self.countdown.is_some_and(|at| at < now) {
            self.show_countdown = false;
        }

        if screen != self.active_screen {
            self.previous_screen = Some(self.active_screen);
            self.active_screen = screen;
        }
    }

    pub fn select_match(&mut self, match_id: u64, countdown: Option<DateTime<Utc>>) {
        self.match_id = match_id;
        self.countdown = countdown;
    }

    pub fn set_active_player(&mut self, slot: PlayerSlot) {
        self.active_player = slot;
    }

    pub fn set_countdown(&mut self, at: Option<DateTime<Utc>>) {
        self.countdown = at;
    }

    pub fn set_countdown_visible(&mut self, visible: bool) {
        self.show_countdown = visible;
    }

    pub fn set_automatic_select(&mut self, enabled: bool) {
        self.automatic_select = enabled;
    }

    pub fn set_showcase_beatmap(&mut self, slot: impl Into<String>) {
        self.showcase_beatmap = Some(slot.into());
    }

    pub fn toggle_showcase_playing(&mut self) {
        self.showcase_playing = !self.showcase_playing;
    }

    pub fn set_seeding_team(&mut self, team: Option<String>) {
        self.seeding_team = team;
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    /// Helper: every map in all four sequences, in order.
    fn all_maps(state: &SettingsState) -> Vec<String> {
        let mut maps = Vec::new();
        for slot in PlayerSlot::ALL {
            for kind in SelectionKind::ALL {
                maps.extend(state.selections(slot).list(kind).iter().cloned());
            }
        }
        maps
    }

    #[test]
    fn default_state_matches_startup_values() {
        let state = SettingsState::default();
        assert_eq!(state.match_id, 0);
        assert!(!state.automatic_select);
        assert_eq!(state.active_screen, Screen::Start);
        assert_eq!(state.previous_screen, None);
        assert_eq!(state.active_player, PlayerSlot::Player1);
        assert!(state.player1.picks.is_empty() && state.player2.bans.is_empty());
        assert!(state.show_countdown);
        assert!(state.countdown.is_none());
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let mut state = SettingsState::default();
        state.match_id = 42;
        state.countdown = Some(at(1_700_000_000_000));

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["matchId"], json!(42));
        assert_eq!(value["activeScreen"], json!("start"));
        assert_eq!(value["activePlayer"], json!("player1"));
        assert_eq!(value["countdown"], json!(1_700_000_000_000i64));
        assert_eq!(value["lastPickedBy"], json!(null));
        assert!(value.get("previousScreen").is_none());
    }

    #[test]
    fn optional_fields_default_when_absent() {
        let value = json!({
            "matchId": 3,
            "automaticSelect": true,
            "activeScreen": "versus",
            "activePlayer": "player2",
            "player1": { "bans": [], "picks": ["NM1"] },
            "player2": { "bans": ["HD2"], "picks": [] }
        });

        let state: SettingsState = serde_json::from_value(value).unwrap();
        assert_eq!(state.active_screen, Screen::Versus);
        assert_eq!(state.last_picked_by, None);
        assert!(state.show_countdown);
        assert!(!state.showcase_playing);
        assert!(state.extra.is_empty());
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let value = json!({
            "matchId": 3,
            "automaticSelect": false,
            "activeScreen": "start",
            "activePlayer": "player1",
            "player1": { "bans": [], "picks": [] },
            "player2": { "bans": [], "picks": [] },
            "casterNames": ["a", "b"]
        });

        let state: SettingsState = serde_json::from_value(value).unwrap();
        assert_eq!(state.extra.get("casterNames"), Some(&json!(["a", "b"])));

        let back = serde_json::to_value(&state).unwrap();
        assert_eq!(back["casterNames"], json!(["a", "b"]));
    }

    #[test]
    fn invariant_check_rejects_map_in_two_sequences() {
        let mut state = SettingsState::default();
        state.player1.picks.push("NM1".into());
        state.player2.bans.push("NM1".into());
        assert!(matches!(
            state.check_invariants(),
            Err(ProtocolError::Invariant(_))
        ));
    }

    #[test]
    fn invariant_check_rejects_duplicate_in_one_sequence() {
        let mut state = SettingsState::default();
        state.player2.picks = vec!["DT1".into(), "DT1".into()];
        assert!(state.check_invariants().is_err());
    }

    // -----------------------------------------------------------------------
    // Pick / ban confirmation
    // -----------------------------------------------------------------------

    #[test]
    fn confirm_pick_appends_and_passes_turn() {
        let mut state = SettingsState::default();
        state.confirm_selection(SelectionKind::Pick, "NM1");

        assert_eq!(state.player1.picks, vec!["NM1"]);
        assert_eq!(state.last_picked_by, Some(PlayerSlot::Player1));
        assert_eq!(state.active_player, PlayerSlot::Player2);
    }

    #[test]
    fn confirm_moves_map_from_other_player() {
        let mut state = SettingsState::default();
        state.confirm_selection(SelectionKind::Ban, "HR2");
        assert_eq!(state.player1.bans, vec!["HR2"]);

        // Player 2's turn: picking the same map moves it, never duplicates it.
        state.confirm_selection(SelectionKind::Pick, "HR2");
        assert!(state.player1.bans.is_empty());
        assert_eq!(state.player2.picks, vec!["HR2"]);
        assert_eq!(all_maps(&state), vec!["HR2"]);
    }

    #[test]
    fn confirm_existing_selection_removes_it() {
        let mut state = SettingsState::default();
        state.confirm_selection(SelectionKind::Pick, "DT1");
        state.set_active_player(PlayerSlot::Player1);

        state.confirm_selection(SelectionKind::Pick, "DT1");
        assert!(state.player1.picks.is_empty());
        assert_eq!(state.active_player, PlayerSlot::Player2);
    }

    #[test]
    fn tiebreaker_is_not_attributed() {
        let mut state = SettingsState::default();
        state.confirm_selection(SelectionKind::Pick, "NM1");
        state.confirm_selection(SelectionKind::Pick, "TB1");

        assert_eq!(state.player2.picks, vec!["TB1"]);
        assert_eq!(state.last_picked_by, None);
    }

    #[test]
    fn pick_ban_exclusivity_holds_over_long_sequences() {
        let maps = ["NM1", "NM2", "HD1", "HR1", "DT1", "TB1"];
        let mut state = SettingsState::default();

        // Deterministic pseudo-random walk over maps, kinds and turn changes.
        let mut seed: u32 = 0x2545_f491;
        for step in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let map = maps[(seed as usize) % maps.len()];
            let kind = if seed & 0x100 == 0 {
                SelectionKind::Pick
            } else {
                SelectionKind::Ban
            };
            if step % 7 == 0 {
                state.set_active_player(state.active_player.other());
            }

            state.confirm_selection(kind, map);

            assert!(
                state.check_invariants().is_ok(),
                "exclusivity broken at step {step}: {state:?}"
            );
        }
    }

    #[test]
    fn insertion_order_is_kept() {
        let mut state = SettingsState::default();
        for map in ["NM3", "NM1", "NM2"] {
            state.set_active_player(PlayerSlot::Player2);
            state.confirm_selection(SelectionKind::Ban, map);
        }
        assert_eq!(state.player2.bans, vec!["NM3", "NM1", "NM2"]);
    }

    // -----------------------------------------------------------------------
    // Screens and countdown
    // -----------------------------------------------------------------------

    #[test]
    fn screen_change_records_previous_screen() {
        let mut state = SettingsState::default();
        state.set_active_screen(Screen::Versus, at(0));

        assert_eq!(state.active_screen, Screen::Versus);
        assert_eq!(state.previous_screen, Some(Screen::Start));
    }

    #[test]
    fn same_screen_does_not_touch_previous() {
        let mut state = SettingsState::default();
        state.set_active_screen(Screen::Mappool, at(0));
        state.set_active_screen(Screen::Mappool, at(0));

        assert_eq!(state.previous_screen, Some(Screen::Start));
    }

    #[test]
    fn unrelated_mutations_do_not_touch_previous() {
        let mut state = SettingsState::default();
        state.set_active_screen(Screen::Winner, at(0));
        state.select_match(7, None);
        state.confirm_selection(SelectionKind::Pick, "FM1");
        state.toggle_showcase_playing();

        assert_eq!(state.previous_screen, Some(Screen::Start));
    }

    #[test]
    fn expired_countdown_is_hidden_on_screen_switch() {
        let mut state = SettingsState::default();
        state.set_countdown(Some(at(1_000)));

        state.set_active_screen(Screen::Standby, at(2_000));
        assert!(!state.show_countdown);
    }

    #[test]
    fn pending_countdown_stays_visible() {
        let mut state = SettingsState::default();
        state.set_countdown(Some(at(5_000)));

        state.set_active_screen(Screen::Standby, at(2_000));
        assert!(state.show_countdown);
    }

    #[test]
    fn select_match_sets_countdown() {
        let mut state = SettingsState::default();
        state.select_match(42, Some(at(9_000)));
        assert_eq!(state.match_id, 42);
        assert_eq!(state.countdown, Some(at(9_000)));
    }
}
