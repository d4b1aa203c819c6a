//! Closed-loop track geometry and the queries the car and evaluator run against it.

use std::fs;
use std::path::Path;

use crate::error::AssetFormatError;
use crate::utils::{Segment, Vec2, point_in_polygon, ray_segment_distance};

/// Immutable track: two closed boundary polylines plus a start pose.
#[derive(Debug, Clone)]
pub struct Track {
    outer: Vec<Vec2>,
    inner: Vec<Vec2>,
    walls: Vec<Segment>,
    pub start_point: Vec2,
    pub start_direction: Vec2,
}

impl Track {
    /// Build a track from in-memory geometry.
    /// `start_direction` is normalized; fails if it is zero or the start is off the surface.
    pub fn new(
        outer: Vec<Vec2>,
        inner: Vec<Vec2>,
        start_point: Vec2,
        start_direction: Vec2,
    ) -> Result<Self, String> {
        if outer.len() < 3 || inner.len() < 3 {
            return Err("each boundary needs at least 3 points".into());
        }
        if outer.iter().chain(inner.iter()).any(|p| !p.is_finite()) {
            return Err("boundary contains non-finite coordinates".into());
        }
        let start_direction = start_direction
            .normalized()
            .ok_or_else(|| "start direction must be non-zero".to_string())?;

        let walls = closed_segments(&outer)
            .chain(closed_segments(&inner))
            .filter(|s| s.length() > 0.0)
            .collect();

        let track = Self { outer, inner, walls, start_point, start_direction };
        if !track.is_on_track(start_point) {
            return Err(format!(
                "start point ({}, {}) is not on the drivable surface",
                start_point.x, start_point.y
            ));
        }
        Ok(track)
    }

    /// Parse a `.trk` file.
    ///
    /// ```text
    /// # comment
    /// start 50 200
    /// direction 0 1
    /// outer
    /// 0 0
    /// ...
    /// inner
    /// 100 100
    /// ...
    /// ```
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, AssetFormatError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| AssetFormatError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self, AssetFormatError> {
        enum Section {
            Header,
            Outer,
            Inner,
        }

        let syntax = |line: usize, reason: String| AssetFormatError::Syntax {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let mut section = Section::Header;
        let mut start = None;
        let mut direction = None;
        let mut outer = Vec::new();
        let mut inner = Vec::new();

        for (i, raw) in content.lines().enumerate() {
            let line_no = i + 1;
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut words = line.split_whitespace();
            let head = words.next().unwrap_or("");
            match head {
                "outer" => section = Section::Outer,
                "inner" => section = Section::Inner,
                "start" => start = Some(parse_pair(words).map_err(|r| syntax(line_no, r))?),
                "direction" => direction = Some(parse_pair(words).map_err(|r| syntax(line_no, r))?),
                _ => {
                    let p = parse_pair(line.split_whitespace()).map_err(|r| syntax(line_no, r))?;
                    match section {
                        Section::Outer => outer.push(p),
                        Section::Inner => inner.push(p),
                        Section::Header => {
                            return Err(syntax(line_no, "point outside an outer/inner section".into()));
                        }
                    }
                }
            }
        }

        let invalid = |reason: String| AssetFormatError::Invalid { path: path.to_path_buf(), reason };
        let start = start.ok_or_else(|| invalid("missing `start` line".into()))?;
        let direction = direction.ok_or_else(|| invalid("missing `direction` line".into()))?;
        Self::new(outer, inner, start, direction).map_err(invalid)
    }

    pub fn outer(&self) -> &[Vec2] {
        &self.outer
    }

    pub fn inner(&self) -> &[Vec2] {
        &self.inner
    }

    /// Every boundary segment, outer first.
    pub fn walls(&self) -> &[Segment] {
        &self.walls
    }

    /// Inside the outer loop and outside the inner one.
    pub fn is_on_track(&self, p: Vec2) -> bool {
        point_in_polygon(p, &self.outer) && !point_in_polygon(p, &self.inner)
    }

    /// Distance from `origin` along `dir` to the nearest boundary, capped at `max_range`.
    /// `dir` must be a unit vector.
    pub fn cast_ray(&self, origin: Vec2, dir: Vec2, max_range: f32) -> f32 {
        self.walls
            .iter()
            .filter_map(|w| ray_segment_distance(origin, dir, w))
            .fold(max_range, f32::min)
    }

    /// Axis aligned bounds of the outer boundary: (min, max).
    pub fn bounds(&self) -> (Vec2, Vec2) {
        let mut min = Vec2::new(f32::INFINITY, f32::INFINITY);
        let mut max = Vec2::new(f32::NEG_INFINITY, f32::NEG_INFINITY);
        for p in &self.outer {
            min = Vec2::new(min.x.min(p.x), min.y.min(p.y));
            max = Vec2::new(max.x.max(p.x), max.y.max(p.y));
        }
        (min, max)
    }
}

fn closed_segments(points: &[Vec2]) -> impl Iterator<Item = Segment> + '_ {
    let n = points.len();
    (0..n).map(move |i| Segment::new(points[i], points[(i + 1) % n]))
}

fn parse_pair<'a>(mut words: impl Iterator<Item = &'a str>) -> Result<Vec2, String> {
    let mut next = || -> Result<f32, String> {
        let w = words.next().ok_or_else(|| "expected 2 numbers".to_string())?;
        let v: f32 = w.parse().map_err(|_| format!("invalid number `{w}`"))?;
        if v.is_finite() { Ok(v) } else { Err(format!("non-finite number `{w}`")) }
    };
    let x = next()?;
    let y = next()?;
    if words.next().is_some() {
        return Err("expected 2 numbers".into());
    }
    Ok(Vec2::new(x, y))
}
