//! ==============================================================================
//! catalog.rs - video feed listing for GET /api
//! ==============================================================================
//!
//! purpose:
//!     lists the uploaded videos, ordered by the number embedded in their
//!     filename (vid1, vid2, vid10 ...), and decorates each with a canned
//!     social-media post. recomputed from disk on every request.
//!
//! ==============================================================================

use std::io;
use std::path::Path;

use anyhow::{Context, Result};

use crate::domain::VideoRecord;

pub const DEFAULT_LIMIT: usize = 10;

struct Post {
    channel: &'static str,
    description: &'static str,
    song: &'static str,
    likes: u32,
    messages: u32,
    shares: u32,
}

/// feed decoration, assigned by listing position modulo its length
const CANNED_POSTS: [Post; 8] = [
    Post {
        channel: "What I make for breakfast",
        description: "healthy BLT recipe! 💃 #food #organic",
        song: "Bounce - Ruger",
        likes: 250,
        messages: 120,
        shares: 40,
    },
    Post {
        channel: "Nature is lit",
        description: "#Arizona dust storm 🎵",
        song: "Kolo sound - Nathan",
        likes: 180,
        messages: 95,
        shares: 35,
    },
    Post {
        channel: "What is reality",
        description: "cloud dogs 💛🦋 #viral #dog",
        song: "original sound - KALEI KING 🦋",
        likes: 320,
        messages: 150,
        shares: 60,
    },
    Post {
        channel: "Tropicana",
        description: "spirit moving plants! #weird #plants",
        song: "Dance Floor - DJ Cool",
        likes: 420,
        messages: 180,
        shares: 75,
    },
    Post {
        channel: "TikTTropicana 2r",
        description: "When the beat drops 🎵 #dance #viral",
        song: "Drop It - MC Fresh",
        likes: 550,
        messages: 230,
        shares: 90,
    },
    Post {
        channel: "DanceQueen",
        description: "New moves unlocked! 🔓 #dance #tutorial",
        song: "Rhythm & Flow - Beat Master",
        likes: 380,
        messages: 160,
        shares: 65,
    },
    Post {
        channel: "DanceKing",
        description: "When you nail the choreography 💯 #dance #perfect",
        song: "Move Your Body - Dance Crew",
        likes: 480,
        messages: 200,
        shares: 85,
    },
    Post {
        channel: "DancePro",
        description: "Level up your dance game! 🎮 #dance #skills",
        song: "Game On - DJ Player",
        likes: 520,
        messages: 220,
        shares: 95,
    },
];

/// first run of decimal digits in the file stem; 0 when there is none
///
/// the extension is ignored, so `intro.mp4` sorts with the undated files.
pub fn numeric_key(filename: &str) -> u64 {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let digits: String = stem
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return 0;
    }
    // absurdly long runs sort last
    digits.parse().unwrap_or(u64::MAX)
}

/// regular files in `dir`, numerically ordered, at most `limit`
///
/// blocking; callers on the runtime wrap it in spawn_blocking.
pub fn list_recent(dir: &Path, limit: usize) -> Result<Vec<VideoRecord>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", dir.display()))?;
        // file_type() does not follow symlinks
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    names.sort_by(|a, b| numeric_key(a).cmp(&numeric_key(b)).then_with(|| a.cmp(b)));
    names.truncate(limit);

    Ok(names
        .into_iter()
        .enumerate()
        .map(|(index, filename)| {
            let post = &CANNED_POSTS[index % CANNED_POSTS.len()];
            VideoRecord {
                url: format!("/uploads/{}", urlencoding::encode(&filename)),
                filename,
                channel: post.channel.to_string(),
                description: post.description.to_string(),
                song: post.song.to_string(),
                likes: post.likes,
                messages: post.messages,
                shares: post.shares,
            }
        })
        .collect())
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn numeric_key_uses_first_digit_run() {
        assert_eq!(numeric_key("vid10.mp4"), 10);
        assert_eq!(numeric_key("vid01.mp4"), 1);
        assert_eq!(numeric_key("1712345678901-clip2.webm"), 1_712_345_678_901);
        assert_eq!(numeric_key("intro.mp4"), 0);
        assert_eq!(numeric_key("clip.webm"), 0);
    }

    #[test]
    fn digitless_names_sort_first() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["vid3.mp4", "intro.mp4", "clip.webm"] {
            touch(dir.path(), name);
        }

        let videos = list_recent(dir.path(), DEFAULT_LIMIT).unwrap();
        let names: Vec<_> = videos.iter().map(|v| v.filename.as_str()).collect();
        assert_eq!(names, ["clip.webm", "intro.mp4", "vid3.mp4"]);
    }

    #[test]
    fn orders_numerically_not_lexically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["vid2.mp4", "vid10.mp4", "vid1.mp4"] {
            touch(dir.path(), name);
        }
        std::fs::create_dir(dir.path().join("vid0")).unwrap();

        let videos = list_recent(dir.path(), DEFAULT_LIMIT).unwrap();
        let names: Vec<_> = videos.iter().map(|v| v.filename.as_str()).collect();
        assert_eq!(names, ["vid1.mp4", "vid2.mp4", "vid10.mp4"]);
        assert_eq!(videos[0].url, "/uploads/vid1.mp4");
        assert_eq!(videos[0].channel, "What I make for breakfast");
        assert_eq!(videos[2].likes, 320);
    }

    #[test]
    fn truncates_and_wraps_metadata() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            touch(dir.path(), &format!("vid{i:02}.mp4"));
        }

        let videos = list_recent(dir.path(), DEFAULT_LIMIT).unwrap();
        assert_eq!(videos.len(), 10);
        assert_eq!(videos[8].channel, videos[0].channel);
        assert_eq!(videos[9].filename, "vid09.mp4");
    }

    #[test]
    fn url_is_percent_encoded() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "my clip 3.mp4");
        let videos = list_recent(dir.path(), 5).unwrap();
        assert_eq!(videos[0].url, "/uploads/my%20clip%203.mp4");
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_recent(&dir.path().join("uploads"), 10).unwrap().is_empty());
    }
}
