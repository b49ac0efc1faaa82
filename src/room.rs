use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

const COLORS: &[&str] = &[
    "white", "black", "red", "maroon", "yellow", "lime", "green", "aqua", "teal", "blue", "navy",
    "fuchsia", "purple",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub title: String,
    pub video_url: String,
    #[serde(default)]
    pub members: Vec<Member>,
}

/// Public summary of a connected user, as stored on the room and sent to
/// other members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub color: String,
}

impl Member {
    pub fn new(room_id: &str, name: String) -> Self {
        Member {
            id: format!("{room_id}{}", random_letters(5)),
            name,
            color: random_color().to_string(),
        }
    }
}

pub fn random_letters(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(LETTERS[rng.gen_range(0..LETTERS.len())]))
        .collect()
}

pub fn random_color() -> &'static str {
    COLORS.choose(&mut rand::thread_rng()).copied().unwrap_or("white")
}
