//! Rating and catalog records in the MovieLens 100k layout, a seeded
//! synthetic generator, and the per-user temporal hold-out split.
//!
//! Rating lines are `user \t item \t rating [\t timestamp]`. Catalog lines are
//! pipe separated with the item id first, the title second and
//! `GENRE_COUNT` 0/1 genre flags last.

use crate::algorithms::initializer;
use crate::error::{EngineError, Result};
use crate::features::GENRE_COUNT;
use crate::models::{Interaction, ItemId};
use crate::utils::validation::{MAX_RATING, MIN_RATING};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// One catalog entry with its genre indicator vector
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogItem {
    pub item_id: ItemId,
    pub title: String,
    pub genres: Vec<f32>,
}

fn invalid(line: usize, message: impl Into<String>) -> EngineError {
    EngineError::InvalidRecord {
        line,
        message: message.into(),
    }
}

fn parse_field<T: std::str::FromStr>(line: usize, name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(line, format!("invalid {} '{}'", name, raw.trim())))
}

/// Parses tab-separated rating records. Blank lines are ignored.
pub fn parse_ratings(text: &str) -> Result<Vec<Interaction>> {
    let mut interactions = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = raw.split('\t').collect();
        if fields.len() < 3 {
            return Err(invalid(line, format!("expected at least 3 fields, found {}", fields.len())));
        }

        let rating: f32 = parse_field(line, "rating", fields[2])?;
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(invalid(line, format!("rating {} outside [{}, {}]", rating, MIN_RATING, MAX_RATING)));
        }
        let timestamp = match fields.get(3) {
            Some(raw) => parse_field(line, "timestamp", raw)?,
            None => 0,
        };

        interactions.push(Interaction {
            user_id: parse_field(line, "user id", fields[0])?,
            item_id: parse_field(line, "item id", fields[1])?,
            rating,
            timestamp,
        });
    }

    Ok(interactions)
}

/// Parses pipe-separated catalog records; the trailing genre flags become
/// the item's genre vector.
pub fn parse_catalog(text: &str) -> Result<Vec<CatalogItem>> {
    let mut items = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = raw.split('|').collect();
        if fields.len() < GENRE_COUNT + 2 {
            return Err(invalid(
                line,
                format!("expected at least {} fields, found {}", GENRE_COUNT + 2, fields.len()),
            ));
        }

        let genres = fields[fields.len() - GENRE_COUNT..]
            .iter()
            .map(|flag| match flag.trim() {
                "0" => Ok(0.0),
                "1" => Ok(1.0),
                other => Err(invalid(line, format!("invalid genre flag '{}'", other))),
            })
            .collect::<Result<Vec<f32>>>()?;

        items.push(CatalogItem {
            item_id: parse_field(line, "item id", fields[0])?,
            title: fields[1].to_string(),
            genres,
        });
    }

    Ok(items)
}

pub fn load_ratings(path: impl AsRef<Path>) -> Result<Vec<Interaction>> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let interactions = parse_ratings(&text)?;
    info!(
        path = %path.as_ref().display(),
        interactions = interactions.len(),
        "Loaded rating records"
    );
    Ok(interactions)
}

/// Catalog files are not always UTF-8; invalid bytes are replaced.
pub fn load_catalog(path: impl AsRef<Path>) -> Result<Vec<CatalogItem>> {
    let bytes = std::fs::read(path.as_ref())?;
    let items = parse_catalog(&String::from_utf8_lossy(&bytes))?;
    info!(path = %path.as_ref().display(), items = items.len(), "Loaded catalog records");
    Ok(items)
}

/// Seeded interactions with a low-rank preference structure.
///
/// Each user and item gets a hidden taste vector; ratings are the scaled
/// agreement plus noise, rounded into [1, 5]. Timestamps increase per user.
pub fn synthetic_interactions(users: u32, items: u32, per_user: usize, seed: u64) -> Vec<Interaction> {
    const TASTE_DIM: usize = 4;
    let mut rng = initializer::seeded_rng(seed);

    let user_taste: Vec<Vec<f32>> = (0..users)
        .map(|_| initializer::normal(&mut rng, TASTE_DIM, 0.0, 1.0))
        .collect();
    let item_taste: Vec<Vec<f32>> = (0..items)
        .map(|_| initializer::normal(&mut rng, TASTE_DIM, 0.0, 1.0))
        .collect();

    let catalog: Vec<ItemId> = (0..items).collect();
    let per_user = per_user.min(items as usize);
    let mut interactions = Vec::with_capacity(users as usize * per_user);

    for user in 0..users {
        let picked: Vec<ItemId> = catalog.choose_multiple(&mut rng, per_user).copied().collect();
        for (step, item) in picked.into_iter().enumerate() {
            let affinity = crate::utils::dot(&user_taste[user as usize], &item_taste[item as usize]);
            let noise: f32 = rng.gen_range(-0.5..0.5);
            let rating = (3.0 + affinity * 0.75 + noise).round().clamp(MIN_RATING, MAX_RATING);
            let timestamp = 880_000_000 + (user as i64) * 10_000 + step as i64 * 60;
            interactions.push(Interaction::new(user + 1, item + 1, rating).with_timestamp(timestamp));
        }
    }

    interactions
}

/// Holds out each user's `holdout_per_user` most recent interactions.
///
/// Users with no more than `holdout_per_user` interactions stay entirely in
/// the training set. Ties on timestamp keep input order.
pub fn temporal_split(interactions: &[Interaction], holdout_per_user: usize) -> (Vec<Interaction>, Vec<Interaction>) {
    let mut by_user: HashMap<u32, Vec<usize>> = HashMap::new();
    for (idx, interaction) in interactions.iter().enumerate() {
        by_user.entry(interaction.user_id).or_default().push(idx);
    }

    let mut held_out = vec![false; interactions.len()];
    for indices in by_user.values_mut() {
        if indices.len() <= holdout_per_user {
            continue;
        }
        indices.sort_by_key(|&idx| interactions[idx].timestamp);
        for &idx in &indices[indices.len() - holdout_per_user..] {
            held_out[idx] = true;
        }
    }

    let mut train = Vec::with_capacity(interactions.len());
    let mut test = Vec::new();
    for (interaction, &is_test) in interactions.iter().zip(&held_out) {
        if is_test {
            test.push(*interaction);
        } else {
            train.push(*interaction);
        }
    }
    (train, test)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ratings() {
        let text = "196\t242\t3\t881250949\n\n186\t302\t5\t891717742\n22\t377\t1\n";
        let interactions = parse_ratings(text).unwrap();
        assert_eq!(interactions.len(), 3);
        assert_eq!(interactions[0], Interaction::new(196, 242, 3.0).with_timestamp(881250949));
        assert_eq!(interactions[2].timestamp, 0);
    }

    #[test]
    fn test_parse_ratings_reports_line() {
        let err = parse_ratings("1\t2\t3\t4\n1\tx\t3\t4\n").unwrap_err();
        assert!(matches!(err, EngineError::InvalidRecord { line: 2, .. }));

        let err = parse_ratings("1\t2\t9\n").unwrap_err();
        assert!(matches!(err, EngineError::InvalidRecord { line: 1, .. }));

        assert!(parse_ratings("1\t2\n").is_err());
    }

    #[test]
    fn test_parse_catalog_genres() {
        let flags = "0|0|0|1|1|1|0|0|0|0|0|0|0|0|0|0|0|0|0";
        let text = format!("1|Toy Story (1995)|01-Jan-1995||http://example.org|{}\n", flags);
        let items = parse_catalog(&text).unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_id, 1);
        assert_eq!(items[0].title, "Toy Story (1995)");
        assert_eq!(items[0].genres.len(), GENRE_COUNT);
        assert_eq!(items[0].genres.iter().sum::<f32>(), 3.0);
        assert_eq!(items[0].genres[3], 1.0);
    }

    #[test]
    fn test_parse_catalog_rejects_short_records() {
        assert!(matches!(
            parse_catalog("1|Title|0|1\n"),
            Err(EngineError::InvalidRecord { line: 1, .. })
        ));
    }

    #[test]
    fn test_synthetic_interactions_are_seeded_and_valid() {
        let a = synthetic_interactions(10, 30, 12, 7);
        let b = synthetic_interactions(10, 30, 12, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 120);
        assert!(a.iter().all(|i| (MIN_RATING..=MAX_RATING).contains(&i.rating)));
        assert!(a.iter().all(|i| i.user_id >= 1 && i.item_id >= 1 && i.item_id <= 30));
    }

    #[test]
    fn test_temporal_split_holds_out_latest() {
        let interactions = vec![
            Interaction::new(1, 10, 4.0).with_timestamp(30),
            Interaction::new(1, 11, 3.0).with_timestamp(10),
            Interaction::new(1, 12, 5.0).with_timestamp(20),
            Interaction::new(2, 10, 2.0).with_timestamp(5),
        ];
        let (train, test) = temporal_split(&interactions, 1);

        assert_eq!(test, vec![Interaction::new(1, 10, 4.0).with_timestamp(30)]);
        assert_eq!(train.len(), 3);
        assert!(train.iter().any(|i| i.user_id == 2));
    }
}
