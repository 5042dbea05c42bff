//! ASCII DXF reader and SVG renderer.
//!
//! Model space geometry from the `ENTITIES` section is read, with block
//! references (`INSERT`, `DIMENSION`) expanded from the `BLOCKS` section.
//! Rendered entities are `LINE`, `CIRCLE`, `ARC`, `ELLIPSE`, `SPLINE`,
//! `LWPOLYLINE`, `POLYLINE`/`VERTEX`, `POINT`, `TEXT`, `MTEXT` and visible
//! `ATTRIB`s. Curves without an SVG primitive are flattened to polylines.
//! Everything else is counted as skipped.

use std::collections::HashMap;
use std::f64::consts::TAU;
use std::fmt::Write as _;
use thiserror::Error;

/// Page width of the rendered drawing, in points (US Letter).
pub const PAGE_WIDTH: f64 = 612.0;

const BINARY_SENTINEL: &str = "AutoCAD Binary DXF";

/// Nested block references deeper than this are dropped.
const MAX_BLOCK_DEPTH: usize = 16;

/// Text height when the entity carries none.
const DEFAULT_TEXT_HEIGHT: f64 = 2.5;

/// Segments used to flatten a full turn of a curve.
const SEGMENTS_PER_TURN: f64 = 72.0;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum DxfError {
    #[error("binary DXF files are not supported")]
    Binary,

    #[error("invalid group code {code:?} at line {line}")]
    InvalidGroupCode { line: usize, code: String },

    #[error("invalid value {value:?} for group code {code} at line {line}")]
    InvalidValue { line: usize, code: i32, value: String },

    #[error("file ends in the middle of a group")]
    Truncated,

    #[error("missing ENTITIES section")]
    MissingEntities,

    #[error("drawing contains no supported entities")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Line { start: Point, end: Point },
    Circle { center: Point, radius: f64 },
    /// Angles in degrees, counter-clockwise from `start_angle` to `end_angle`.
    Arc { center: Point, radius: f64, start_angle: f64, end_angle: f64 },
    Polyline { points: Vec<Point>, closed: bool },
    Point(Point),
    /// Single-line or multi-line text anchored at its baseline start.
    /// `rotation` is in degrees, counter-clockwise.
    Text { position: Point, height: f64, rotation: f64, content: String },
}

#[derive(Debug, Default, PartialEq)]
pub struct Drawing {
    pub entities: Vec<Entity>,
    /// Entities seen but not rendered.
    pub skipped: usize,
}

impl Drawing {
    pub fn has_text(&self) -> bool {
        self.entities.iter().any(|e| matches!(e, Entity::Text { .. }))
    }
}

struct Group<'a> {
    line: usize,
    code: i32,
    value: &'a str,
}

impl Group<'_> {
    fn float(&self) -> Result<f64, DxfError> {
        self.value.trim().parse().map_err(|_| DxfError::InvalidValue {
            line: self.line,
            code: self.code,
            value: self.value.to_string(),
        })
    }

    fn int(&self) -> Result<i64, DxfError> {
        self.value.trim().parse().map_err(|_| DxfError::InvalidValue {
            line: self.line,
            code: self.code,
            value: self.value.to_string(),
        })
    }

    fn is(&self, code: i32, value: &str) -> bool {
        self.code == code && self.value.trim() == value
    }
}

fn groups(text: &str) -> Result<Vec<Group<'_>>, DxfError> {
    let mut lines = text.lines().enumerate();
    let mut groups = Vec::new();
    while let Some((idx, code)) = lines.next() {
        if code.trim().is_empty() && groups.is_empty() {
            continue;
        }
        let Some((_, value)) = lines.next() else {
            return Err(DxfError::Truncated);
        };
        let code_num = code.trim().parse().map_err(|_| DxfError::InvalidGroupCode {
            line: idx + 1,
            code: code.to_string(),
        })?;
        groups.push(Group {
            line: idx + 2,
            code: code_num,
            value: value.trim_end_matches('\r'),
        });
    }
    Ok(groups)
}

/// Splits a run of groups into `(kind, body)` records at each code 0.
fn records<'g, 'a>(mut rest: &'g [Group<'a>]) -> Vec<(&'g str, &'g [Group<'a>])> {
    let mut out = Vec::new();
    while let Some(head) = rest.first() {
        if head.code != 0 {
            rest = &rest[1..];
            continue;
        }
        let end = rest[1..]
            .iter()
            .position(|g| g.code == 0)
            .map(|p| p + 1)
            .unwrap_or(rest.len());
        out.push((head.value.trim(), &rest[1..end]));
        rest = &rest[end..];
    }
    out
}

/// Groups between `0 SECTION / 2 <name>` and its `0 ENDSEC`.
fn section<'g, 'a>(groups: &'g [Group<'a>], name: &str) -> Option<&'g [Group<'a>]> {
    let start = groups
        .windows(2)
        .position(|w| w[0].is(0, "SECTION") && w[1].is(2, name))?
        + 2;
    let len = groups[start..]
        .iter()
        .position(|g| g.is(0, "ENDSEC"))
        .unwrap_or(groups.len() - start);
    Some(&groups[start..start + len])
}

/// A block reference awaiting expansion.
#[derive(Debug, Clone, PartialEq)]
struct Insert {
    block: String,
    at: Point,
    scale_x: f64,
    scale_y: f64,
    rotation: f64,
}

#[derive(Debug, Clone, PartialEq)]
enum Item {
    Entity(Entity),
    Insert(Insert),
}

struct Block {
    base: Point,
    items: Vec<Item>,
    skipped: usize,
}

/// Reads entity records, joining `POLYLINE`/`VERTEX`/`SEQEND` runs.
fn read_items(records: &[(&str, &[Group<'_>])]) -> Result<(Vec<Item>, usize), DxfError> {
    let mut items = Vec::new();
    let mut skipped = 0;
    let mut open_polyline: Option<(Vec<Point>, bool)> = None;

    for &(kind, body) in records {
        if find(body, 67).map(Group::int).transpose()? == Some(1) {
            // Paper space.
            skipped += 1;
            continue;
        }
        match kind {
            "POLYLINE" => {
                let flags = find(body, 70).map(Group::int).transpose()?.unwrap_or(0);
                open_polyline = Some((Vec::new(), flags & 1 == 1));
            }
            "VERTEX" => match open_polyline.as_mut() {
                Some((points, _)) => points.push(point(body, 10, 20)?),
                None => skipped += 1,
            },
            "SEQEND" => {
                if let Some((points, closed)) = open_polyline.take() {
                    items.push(Item::Entity(Entity::Polyline { points, closed }));
                }
            }
            "INSERT" => match find(body, 2) {
                Some(name) => items.push(Item::Insert(Insert {
                    block: name.value.trim().to_string(),
                    at: point(body, 10, 20)?,
                    scale_x: float_or(body, 41, 1.0)?,
                    scale_y: float_or(body, 42, 1.0)?,
                    rotation: float_or(body, 50, 0.0)?,
                })),
                None => skipped += 1,
            },
            // Dimension graphics live in an anonymous block in world coordinates.
            "DIMENSION" => match find(body, 2) {
                Some(name) => items.push(Item::Insert(Insert {
                    block: name.value.trim().to_string(),
                    at: Point { x: 0.0, y: 0.0 },
                    scale_x: 1.0,
                    scale_y: 1.0,
                    rotation: 0.0,
                })),
                None => skipped += 1,
            },
            other => match entity(other, body)? {
                Some(entity) => items.push(Item::Entity(entity)),
                None => skipped += 1,
            },
        }
    }

    if let Some((points, closed)) = open_polyline {
        items.push(Item::Entity(Entity::Polyline { points, closed }));
    }
    Ok((items, skipped))
}

fn read_blocks(groups: &[Group<'_>]) -> Result<HashMap<String, Block>, DxfError> {
    let mut blocks = HashMap::new();
    let Some(section) = section(groups, "BLOCKS") else {
        return Ok(blocks);
    };

    let records = records(section);
    let mut i = 0;
    while i < records.len() {
        let (kind, header) = records[i];
        i += 1;
        if kind != "BLOCK" {
            continue;
        }
        let end = records[i..]
            .iter()
            .position(|(kind, _)| *kind == "ENDBLK")
            .map(|p| i + p)
            .unwrap_or(records.len());
        let (items, skipped) = read_items(&records[i..end])?;
        i = end + 1;

        let name = find(header, 2).map(|g| g.value.trim().to_string()).unwrap_or_default();
        blocks.insert(
            name,
            Block {
                base: point(header, 10, 20)?,
                items,
                skipped,
            },
        );
    }
    Ok(blocks)
}

/// Parses the model space of an ASCII DXF document.
pub fn parse(text: &str) -> Result<Drawing, DxfError> {
    if text.starts_with(BINARY_SENTINEL) {
        return Err(DxfError::Binary);
    }
    let groups = groups(text)?;
    let entities = section(&groups, "ENTITIES").ok_or(DxfError::MissingEntities)?;
    let blocks = read_blocks(&groups)?;
    let (items, skipped) = read_items(&records(entities))?;

    let mut drawing = Drawing {
        entities: Vec::new(),
        skipped,
    };
    expand(&items, &Transform::IDENTITY, &blocks, 0, &mut drawing);
    Ok(drawing)
}

fn expand(
    items: &[Item],
    transform: &Transform,
    blocks: &HashMap<String, Block>,
    depth: usize,
    drawing: &mut Drawing,
) {
    for item in items {
        match item {
            Item::Entity(entity) => drawing.entities.push(transform.entity(entity)),
            Item::Insert(insert) => match blocks.get(&insert.block) {
                Some(block) if depth < MAX_BLOCK_DEPTH => {
                    let inner = Transform::placement(block.base, insert).then(transform);
                    drawing.skipped += block.skipped;
                    expand(&block.items, &inner, blocks, depth + 1, drawing);
                }
                _ => drawing.skipped += 1,
            },
        }
    }
}

fn find<'g, 'a>(body: &'g [Group<'a>], code: i32) -> Option<&'g Group<'a>> {
    body.iter().find(|g| g.code == code)
}

fn float_or(body: &[Group<'_>], code: i32, default: f64) -> Result<f64, DxfError> {
    Ok(find(body, code).map(Group::float).transpose()?.unwrap_or(default))
}

fn point(body: &[Group<'_>], x: i32, y: i32) -> Result<Point, DxfError> {
    Ok(Point {
        x: float_or(body, x, 0.0)?,
        y: float_or(body, y, 0.0)?,
    })
}

/// Every `(x, y)` pair of a repeated coordinate group, in order.
fn points(body: &[Group<'_>], x: i32, y: i32) -> Result<Vec<Point>, DxfError> {
    let mut points = Vec::new();
    let mut pending_x = None;
    for group in body {
        if group.code == x {
            pending_x = Some(group.float()?);
        } else if group.code == y {
            if let Some(x) = pending_x.take() {
                points.push(Point { x, y: group.float()? });
            }
        }
    }
    Ok(points)
}

fn floats(body: &[Group<'_>], code: i32) -> Result<Vec<f64>, DxfError> {
    body.iter().filter(|g| g.code == code).map(Group::float).collect()
}

fn text_value(body: &[Group<'_>]) -> String {
    // MTEXT splits long strings into leading code 3 chunks.
    body.iter()
        .filter(|g| g.code == 3)
        .chain(body.iter().filter(|g| g.code == 1))
        .map(|g| g.value)
        .collect()
}

fn entity(kind: &str, body: &[Group<'_>]) -> Result<Option<Entity>, DxfError> {
    let entity = match kind {
        "LINE" => Entity::Line {
            start: point(body, 10, 20)?,
            end: point(body, 11, 21)?,
        },
        "CIRCLE" => Entity::Circle {
            center: point(body, 10, 20)?,
            radius: float_or(body, 40, 0.0)?,
        },
        "ARC" => Entity::Arc {
            center: point(body, 10, 20)?,
            radius: float_or(body, 40, 0.0)?,
            start_angle: float_or(body, 50, 0.0)?,
            end_angle: float_or(body, 51, 360.0)?,
        },
        "POINT" => Entity::Point(point(body, 10, 20)?),
        "LWPOLYLINE" => {
            let flags = find(body, 70).map(Group::int).transpose()?.unwrap_or(0);
            Entity::Polyline {
                points: points(body, 10, 20)?,
                closed: flags & 1 == 1,
            }
        }
        "ELLIPSE" => {
            let start = float_or(body, 41, 0.0)?;
            let end = float_or(body, 42, TAU)?;
            Entity::Polyline {
                points: ellipse_points(
                    point(body, 10, 20)?,
                    point(body, 11, 21)?,
                    float_or(body, 40, 1.0)?,
                    start,
                    end,
                ),
                closed: is_full_turn(end - start, TAU),
            }
        }
        "SPLINE" => {
            let flags = find(body, 70).map(Group::int).transpose()?.unwrap_or(0);
            let control = points(body, 10, 20)?;
            let points = if control.is_empty() {
                points(body, 11, 21)?
            } else {
                let degree = find(body, 71).map(Group::int).transpose()?.unwrap_or(3);
                spline_points(
                    usize::try_from(degree).unwrap_or(0),
                    &floats(body, 40)?,
                    &control,
                    &floats(body, 41)?,
                )
            };
            Entity::Polyline {
                points,
                closed: flags & 1 == 1,
            }
        }
        "TEXT" | "ATTRIB" => {
            // ATTRIB flag 1 marks an invisible attribute.
            let flags = find(body, 70).map(Group::int).transpose()?.unwrap_or(0);
            if kind == "ATTRIB" && flags & 1 == 1 {
                return Ok(None);
            }
            Entity::Text {
                position: point(body, 10, 20)?,
                height: float_or(body, 40, DEFAULT_TEXT_HEIGHT)?,
                rotation: float_or(body, 50, 0.0)?,
                content: text_value(body),
            }
        }
        "MTEXT" => {
            let rotation = match find(body, 11) {
                Some(_) => {
                    let dir = point(body, 11, 21)?;
                    dir.y.atan2(dir.x).to_degrees()
                }
                None => float_or(body, 50, 0.0)?,
            };
            Entity::Text {
                position: point(body, 10, 20)?,
                height: float_or(body, 40, DEFAULT_TEXT_HEIGHT)?,
                rotation,
                content: plain_mtext(&text_value(body)),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(entity))
}

/// Drops MTEXT inline formatting, keeping paragraph breaks as newlines.
fn plain_mtext(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' | '}' => {}
            '\\' => match chars.next() {
                Some('P') | Some('n') => out.push('\n'),
                Some('~') => out.push(' '),
                Some(c @ ('\\' | '{' | '}')) => out.push(c),
                // Codes with an argument run up to the next ';'.
                Some('f' | 'F' | 'H' | 'W' | 'Q' | 'T' | 'A' | 'C' | 'c' | 'p') => {
                    for c in chars.by_ref() {
                        if c == ';' {
                            break;
                        }
                    }
                }
                Some(_) | None => {}
            },
            other => out.push(other),
        }
    }
    out
}

fn is_full_turn(sweep: f64, turn: f64) -> bool {
    (sweep.abs() - turn).abs() < EPSILON || sweep.abs() > turn
}

/// Positive sweep from `start` to `end`, in `(0, turn]`.
fn sweep(start: f64, end: f64, turn: f64) -> f64 {
    let mut sweep = (end - start) % turn;
    if sweep <= EPSILON {
        sweep += turn;
    }
    sweep
}

fn segments(sweep: f64, turn: f64) -> usize {
    ((sweep / turn) * SEGMENTS_PER_TURN).ceil().max(8.0) as usize
}

fn arc_points(center: Point, radius: f64, start_deg: f64, end_deg: f64) -> Vec<Point> {
    let sweep = sweep(start_deg, end_deg, 360.0);
    let n = segments(sweep, 360.0);
    (0..=n)
        .map(|i| {
            let rad = (start_deg + sweep * i as f64 / n as f64).to_radians();
            Point {
                x: center.x + radius * rad.cos(),
                y: center.y + radius * rad.sin(),
            }
        })
        .collect()
}

/// `major` is the major axis endpoint relative to `center`; parameters are
/// in radians.
fn ellipse_points(center: Point, major: Point, ratio: f64, start: f64, end: f64) -> Vec<Point> {
    let minor = Point {
        x: -major.y * ratio,
        y: major.x * ratio,
    };
    let sweep = sweep(start, end, TAU);
    let n = segments(sweep, TAU);
    (0..=n)
        .map(|i| {
            let t = start + sweep * i as f64 / n as f64;
            let (sin, cos) = t.sin_cos();
            Point {
                x: center.x + major.x * cos + minor.x * sin,
                y: center.y + major.y * cos + minor.y * sin,
            }
        })
        .collect()
}

/// Samples a (rational) B-spline with de Boor's algorithm. Inconsistent
/// definitions fall back to the control polygon.
fn spline_points(degree: usize, knots: &[f64], control: &[Point], weights: &[f64]) -> Vec<Point> {
    let n = control.len();
    if degree == 0 || n <= degree || knots.len() != n + degree + 1 {
        return control.to_vec();
    }
    let (lo, hi) = (knots[degree], knots[n]);
    if hi - lo <= EPSILON {
        return control.to_vec();
    }

    let samples = n * 8;
    (0..=samples)
        .map(|i| {
            let u = lo + (hi - lo) * i as f64 / samples as f64;
            de_boor(degree, knots, control, weights, u)
        })
        .collect()
}

fn de_boor(p: usize, knots: &[f64], control: &[Point], weights: &[f64], u: f64) -> Point {
    let n = control.len();
    let mut k = p;
    while k < n - 1 && u >= knots[k + 1] {
        k += 1;
    }

    let weight = |i: usize| weights.get(i).copied().unwrap_or(1.0);
    let mut d: Vec<(f64, f64, f64)> = (0..=p)
        .map(|j| {
            let i = j + k - p;
            let w = weight(i);
            (control[i].x * w, control[i].y * w, w)
        })
        .collect();

    for r in 1..=p {
        for j in (r..=p).rev() {
            let i = j + k - p;
            let denom = knots[i + p + 1 - r] - knots[i];
            let alpha = if denom.abs() < EPSILON { 0.0 } else { (u - knots[i]) / denom };
            let (a, b) = (d[j - 1], d[j]);
            d[j] = (
                (1.0 - alpha) * a.0 + alpha * b.0,
                (1.0 - alpha) * a.1 + alpha * b.1,
                (1.0 - alpha) * a.2 + alpha * b.2,
            );
        }
    }

    let (x, y, w) = d[p];
    if w.abs() < EPSILON {
        Point { x, y }
    } else {
        Point { x: x / w, y: y / w }
    }
}

/// Affine map `(x, y) -> (a x + b y + tx, c x + d y + ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Transform {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    tx: f64,
    ty: f64,
}

impl Transform {
    const IDENTITY: Transform = Transform {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Block coordinates to the coordinates of the referencing space.
    fn placement(base: Point, insert: &Insert) -> Self {
        let (sin, cos) = insert.rotation.to_radians().sin_cos();
        let (a, b) = (cos * insert.scale_x, -sin * insert.scale_y);
        let (c, d) = (sin * insert.scale_x, cos * insert.scale_y);
        Transform {
            a,
            b,
            c,
            d,
            tx: insert.at.x - (a * base.x + b * base.y),
            ty: insert.at.y - (c * base.x + d * base.y),
        }
    }

    /// `self` followed by `outer`.
    fn then(&self, outer: &Transform) -> Transform {
        Transform {
            a: outer.a * self.a + outer.b * self.c,
            b: outer.a * self.b + outer.b * self.d,
            c: outer.c * self.a + outer.d * self.c,
            d: outer.c * self.b + outer.d * self.d,
            tx: outer.a * self.tx + outer.b * self.ty + outer.tx,
            ty: outer.c * self.tx + outer.d * self.ty + outer.ty,
        }
    }

    fn apply(&self, p: Point) -> Point {
        Point {
            x: self.a * p.x + self.b * p.y + self.tx,
            y: self.c * p.x + self.d * p.y + self.ty,
        }
    }

    fn rotation(&self) -> f64 {
        self.c.atan2(self.a).to_degrees()
    }

    /// Uniform scale when the map keeps circles circular and unmirrored.
    fn uniform_scale(&self) -> Option<f64> {
        let similar = (self.a - self.d).abs() < EPSILON && (self.b + self.c).abs() < EPSILON;
        let scale = self.a.hypot(self.c);
        (similar && scale > EPSILON).then_some(scale)
    }

    fn entity(&self, entity: &Entity) -> Entity {
        if *self == Transform::IDENTITY {
            return entity.clone();
        }
        let map = |points: &[Point]| points.iter().map(|p| self.apply(*p)).collect::<Vec<_>>();
        match entity {
            Entity::Line { start, end } => Entity::Line {
                start: self.apply(*start),
                end: self.apply(*end),
            },
            Entity::Point(p) => Entity::Point(self.apply(*p)),
            Entity::Polyline { points, closed } => Entity::Polyline {
                points: map(points),
                closed: *closed,
            },
            Entity::Circle { center, radius } => match self.uniform_scale() {
                Some(scale) => Entity::Circle {
                    center: self.apply(*center),
                    radius: radius * scale,
                },
                None => Entity::Polyline {
                    points: map(&arc_points(*center, *radius, 0.0, 360.0)),
                    closed: true,
                },
            },
            Entity::Arc { center, radius, start_angle, end_angle } => match self.uniform_scale() {
                Some(scale) => Entity::Arc {
                    center: self.apply(*center),
                    radius: radius * scale,
                    start_angle: start_angle + self.rotation(),
                    end_angle: end_angle + self.rotation(),
                },
                None => Entity::Polyline {
                    points: map(&arc_points(*center, *radius, *start_angle, *end_angle)),
                    closed: false,
                },
            },
            Entity::Text { position, height, rotation, content } => Entity::Text {
                position: self.apply(*position),
                height: height * (self.a * self.d - self.b * self.c).abs().sqrt(),
                rotation: rotation + self.rotation(),
                content: content.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
}

impl Bounds {
    fn empty() -> Self {
        Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    fn include(&mut self, p: Point, pad: f64) {
        self.min_x = self.min_x.min(p.x - pad);
        self.min_y = self.min_y.min(p.y - pad);
        self.max_x = self.max_x.max(p.x + pad);
        self.max_y = self.max_y.max(p.y + pad);
    }

    fn is_valid(&self) -> bool {
        self.min_x.is_finite() && self.max_x.is_finite()
    }
}

fn bounds(drawing: &Drawing) -> Bounds {
    let mut b = Bounds::empty();
    for entity in &drawing.entities {
        match entity {
            Entity::Line { start, end } => {
                b.include(*start, 0.0);
                b.include(*end, 0.0);
            }
            Entity::Circle { center, radius } | Entity::Arc { center, radius, .. } => {
                b.include(*center, radius.abs());
            }
            Entity::Polyline { points, .. } => {
                for p in points {
                    b.include(*p, 0.0);
                }
            }
            Entity::Point(p) => b.include(*p, 0.0),
            Entity::Text { position, height, rotation, content } => {
                let lines = content.lines().count().max(1) as f64;
                let longest = content.lines().map(|l| l.chars().count()).max().unwrap_or(0) as f64;
                let (w, h) = (longest * height * TEXT_ADVANCE, *height);
                let below = (lines - 1.0) * h * LINE_SPACING;
                for (dx, dy) in [(0.0, -below), (w, -below), (0.0, h), (w, h)] {
                    b.include(offset(*position, dx, dy, *rotation), 0.0);
                }
            }
        }
    }
    b
}

/// Approximate glyph advance as a fraction of the text height.
const TEXT_ADVANCE: f64 = 0.6;

const LINE_SPACING: f64 = 1.4;

/// `origin` moved by `(dx, dy)` in a frame rotated by `rotation` degrees.
fn offset(origin: Point, dx: f64, dy: f64, rotation: f64) -> Point {
    let (sin, cos) = rotation.to_radians().sin_cos();
    Point {
        x: origin.x + dx * cos - dy * sin,
        y: origin.y + dx * sin + dy * cos,
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

/// Maps drawing coordinates (y up) onto the page (y down).
struct Viewport {
    bounds: Bounds,
    scale: f64,
    margin: f64,
}

impl Viewport {
    fn map(&self, p: Point) -> (f64, f64) {
        (
            (p.x - self.bounds.min_x) * self.scale + self.margin,
            (self.bounds.max_y - p.y) * self.scale + self.margin,
        )
    }
}

/// Renders the drawing as an SVG document `PAGE_WIDTH` points wide with the
/// drawing's aspect ratio.
pub fn to_svg(drawing: &Drawing) -> Result<String, DxfError> {
    let bounds = bounds(drawing);
    if drawing.entities.is_empty() || !bounds.is_valid() {
        return Err(DxfError::Empty);
    }

    let extent_x = (bounds.max_x - bounds.min_x).max(1e-9);
    let extent_y = (bounds.max_y - bounds.min_y).max(1e-9);
    let margin = PAGE_WIDTH * 0.02;
    let scale = (PAGE_WIDTH - 2.0 * margin) / extent_x;
    let height = (extent_y * scale + 2.0 * margin).max(2.0 * margin + 1.0);
    let view = Viewport { bounds, scale, margin };

    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w:.3}" height="{h:.3}" viewBox="0 0 {w:.3} {h:.3}">"#,
        w = PAGE_WIDTH,
        h = height
    );
    svg.push_str(r#"<g fill="none" stroke="black" stroke-width="0.75" stroke-linecap="round" stroke-linejoin="round">"#);

    for entity in &drawing.entities {
        match entity {
            Entity::Line { start, end } => {
                let (x1, y1) = view.map(*start);
                let (x2, y2) = view.map(*end);
                let _ = write!(svg, r#"<line x1="{x1:.3}" y1="{y1:.3}" x2="{x2:.3}" y2="{y2:.3}"/>"#);
            }
            Entity::Circle { center, radius } => {
                let (cx, cy) = view.map(*center);
                let _ = write!(svg, r#"<circle cx="{cx:.3}" cy="{cy:.3}" r="{:.3}"/>"#, radius * scale);
            }
            Entity::Arc { center, radius, start_angle, end_angle } => {
                write_arc(&mut svg, &view, *center, *radius, *start_angle, *end_angle);
            }
            Entity::Polyline { points, closed } => {
                if points.is_empty() {
                    continue;
                }
                let coords: Vec<String> = points
                    .iter()
                    .map(|p| {
                        let (x, y) = view.map(*p);
                        format!("{x:.3},{y:.3}")
                    })
                    .collect();
                let tag = if *closed { "polygon" } else { "polyline" };
                let _ = write!(svg, r#"<{tag} points="{}"/>"#, coords.join(" "));
            }
            Entity::Point(p) => {
                let (x, y) = view.map(*p);
                let _ = write!(svg, r#"<circle cx="{x:.3}" cy="{y:.3}" r="0.75" fill="black"/>"#);
            }
            Entity::Text { position, height, rotation, content } => {
                let size = height * scale;
                for (i, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let baseline = offset(*position, 0.0, -(i as f64) * height * LINE_SPACING, *rotation);
                    let (x, y) = view.map(baseline);
                    let _ = write!(
                        svg,
                        r#"<text x="{x:.3}" y="{y:.3}" font-size="{size:.3}" font-family="sans-serif" fill="black" stroke="none" transform="rotate({r:.3} {x:.3} {y:.3})">{}</text>"#,
                        escape_xml(line),
                        r = -rotation,
                    );
                }
            }
        }
    }

    svg.push_str("</g></svg>");
    Ok(svg)
}

fn write_arc(svg: &mut String, view: &Viewport, center: Point, radius: f64, start: f64, end: f64) {
    let mut sweep = (end - start) % 360.0;
    if sweep <= 0.0 {
        sweep += 360.0;
    }
    let r = radius * view.scale;
    if (sweep - 360.0).abs() < 1e-9 {
        let (cx, cy) = view.map(center);
        let _ = write!(svg, r#"<circle cx="{cx:.3}" cy="{cy:.3}" r="{r:.3}"/>"#);
        return;
    }

    let at = |deg: f64| {
        let rad = deg.to_radians();
        view.map(Point {
            x: center.x + radius * rad.cos(),
            y: center.y + radius * rad.sin(),
        })
    };
    let (x0, y0) = at(start);
    let (x1, y1) = at(start + sweep);
    let large = u8::from(sweep > 180.0);
    // Counter-clockwise in drawing space is the negative direction once y is flipped.
    let _ = write!(
        svg,
        r#"<path d="M {x0:.3} {y0:.3} A {r:.3} {r:.3} 0 {large} 0 {x1:.3} {y1:.3}"/>"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = include_str!("../test/fixtures/plate.dxf");

    fn document(blocks: &str, entities: &str) -> String {
        format!(
            "0\nSECTION\n2\nBLOCKS\n{blocks}0\nENDSEC\n\
0\nSECTION\n2\nENTITIES\n{entities}0\nENDSEC\n0\nEOF\n"
        )
    }

    fn assert_close(actual: Point, x: f64, y: f64) {
        assert!(
            (actual.x - x).abs() < 1e-6 && (actual.y - y).abs() < 1e-6,
            "expected ({x}, {y}), got {actual:?}"
        );
    }

    #[test]
    fn test_parse_entities() {
        let drawing = parse(SAMPLE).unwrap();
        assert_eq!(drawing.entities.len(), 5);
        assert_eq!(drawing.skipped, 0);
        assert_eq!(
            drawing.entities[0],
            Entity::Line {
                start: Point { x: 0.0, y: 0.0 },
                end: Point { x: 100.0, y: 50.0 },
            }
        );
        assert_eq!(
            drawing.entities[3],
            Entity::Polyline {
                points: vec![
                    Point { x: 0.0, y: 0.0 },
                    Point { x: 10.0, y: 0.0 },
                    Point { x: 10.0, y: 10.0 },
                ],
                closed: true,
            }
        );
    }

    #[test]
    fn test_insert_expands_block() {
        let blocks = "0\nBLOCK\n2\nBOLT\n10\n1\n20\n0\n\
0\nLINE\n10\n1\n20\n0\n11\n2\n21\n0\n0\nCIRCLE\n10\n1\n20\n0\n40\n1\n0\nENDBLK\n";
        let entities = "0\nINSERT\n2\nBOLT\n10\n10\n20\n5\n41\n2\n42\n2\n50\n90\n";
        let drawing = parse(&document(blocks, entities)).unwrap();

        assert_eq!(drawing.skipped, 0);
        assert_eq!(drawing.entities.len(), 2);
        match &drawing.entities[0] {
            Entity::Line { start, end } => {
                assert_close(*start, 10.0, 5.0);
                assert_close(*end, 10.0, 7.0);
            }
            other => panic!("expected a line, got {other:?}"),
        }
        match &drawing.entities[1] {
            Entity::Circle { center, radius } => {
                assert_close(*center, 10.0, 5.0);
                assert!((radius - 2.0).abs() < 1e-9);
            }
            other => panic!("expected a circle, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_and_non_uniform_inserts() {
        let blocks = "0\nBLOCK\n2\nDOT\n10\n0\n20\n0\n0\nCIRCLE\n10\n0\n20\n0\n40\n1\n0\nENDBLK\n\
0\nBLOCK\n2\nPAIR\n10\n0\n20\n0\n0\nINSERT\n2\nDOT\n10\n0\n20\n0\n0\nINSERT\n2\nDOT\n10\n4\n20\n0\n0\nENDBLK\n";
        let entities = "0\nINSERT\n2\nPAIR\n10\n0\n20\n0\n41\n2\n42\n1\n";
        let drawing = parse(&document(blocks, entities)).unwrap();

        assert_eq!(drawing.entities.len(), 2);
        match &drawing.entities[1] {
            Entity::Polyline { points, closed } => {
                assert!(*closed);
                // Stretched horizontally around (8, 0).
                assert_close(points[0], 10.0, 0.0);
                let top = points.iter().map(|p| p.y).fold(f64::MIN, f64::max);
                assert!((top - 1.0).abs() < 1e-3);
            }
            other => panic!("expected a flattened circle, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_or_recursive_blocks_are_skipped() {
        let blocks = "0\nBLOCK\n2\nLOOP\n10\n0\n20\n0\n0\nLINE\n11\n1\n21\n0\n0\nINSERT\n2\nLOOP\n10\n0\n20\n0\n0\nENDBLK\n";
        let entities = "0\nINSERT\n2\nMISSING\n10\n0\n20\n0\n0\nINSERT\n2\nLOOP\n10\n0\n20\n0\n";
        let drawing = parse(&document(blocks, entities)).unwrap();

        assert_eq!(drawing.entities.len(), MAX_BLOCK_DEPTH);
        assert_eq!(drawing.skipped, 2);
    }

    #[test]
    fn test_text_ellipse_and_dimension() {
        let blocks = "0\nBLOCK\n2\n*D1\n10\n0\n20\n0\n0\nLINE\n10\n0\n20\n-2\n11\n10\n21\n-2\n0\nENDBLK\n";
        let entities = "0\nTEXT\n10\n1\n20\n2\n40\n3\n1\nA&B\n\
0\nMTEXT\n10\n0\n20\n20\n40\n2\n3\n{\\fArial;first}\n1\n\\Psecond\n\
0\nELLIPSE\n10\n0\n20\n0\n11\n4\n21\n0\n40\n0.5\n\
0\nDIMENSION\n2\n*D1\n";
        let drawing = parse(&document(blocks, entities)).unwrap();

        assert_eq!(drawing.skipped, 0);
        assert_eq!(drawing.entities.len(), 4);
        assert!(drawing.has_text());
        assert_eq!(
            drawing.entities[0],
            Entity::Text {
                position: Point { x: 1.0, y: 2.0 },
                height: 3.0,
                rotation: 0.0,
                content: "A&B".to_string(),
            }
        );
        match &drawing.entities[1] {
            Entity::Text { content, .. } => assert_eq!(content, "first\nsecond"),
            other => panic!("expected text, got {other:?}"),
        }
        match &drawing.entities[2] {
            Entity::Polyline { points, closed } => {
                assert!(*closed);
                assert_close(points[0], 4.0, 0.0);
                let top = points.iter().map(|p| p.y).fold(f64::MIN, f64::max);
                assert!((top - 2.0).abs() < 1e-3);
            }
            other => panic!("expected a flattened ellipse, got {other:?}"),
        }
        assert!(matches!(drawing.entities[3], Entity::Line { .. }));

        let svg = to_svg(&drawing).unwrap();
        assert!(svg.contains(">A&amp;B</text>"));
        assert!(svg.contains(">second</text>"));
    }

    #[test]
    fn test_spline_passes_through_end_points() {
        let entities = "0\nSPLINE\n70\n8\n71\n2\n\
40\n0\n40\n0\n40\n0\n40\n1\n40\n1\n40\n1\n\
10\n0\n20\n0\n10\n5\n20\n10\n10\n10\n20\n0\n";
        let drawing = parse(&document("", entities)).unwrap();

        match &drawing.entities[0] {
            Entity::Polyline { points, closed } => {
                assert!(!*closed);
                assert_close(points[0], 0.0, 0.0);
                assert_close(*points.last().unwrap(), 10.0, 0.0);
                // Quadratic Bezier apex at t = 0.5.
                assert_close(points[points.len() / 2], 5.0, 5.0);
            }
            other => panic!("expected a sampled spline, got {other:?}"),
        }
    }

    #[test]
    fn test_paper_space_and_invisible_attributes_skipped() {
        let entities = "0\nLINE\n67\n1\n10\n0\n20\n0\n11\n1\n21\n1\n\
0\nATTRIB\n70\n1\n1\nhidden\n0\nPOINT\n10\n3\n20\n3\n";
        let drawing = parse(&document("", entities)).unwrap();

        assert_eq!(drawing.entities, vec![Entity::Point(Point { x: 3.0, y: 3.0 })]);
        assert_eq!(drawing.skipped, 2);
    }

    #[test]
    fn test_plain_mtext() {
        assert_eq!(plain_mtext(r"{\H2.5;Big}\Pnext\~word"), "Big\nnext word");
        assert_eq!(plain_mtext(r"a\\b"), r"a\b");
    }

    #[test]
    fn test_parse_old_style_polyline() {
        let text = "0\nSECTION\n2\nENTITIES\n0\nPOLYLINE\n70\n0\n\
0\nVERTEX\n10\n1\n20\n2\n0\nVERTEX\n10\n3\n20\n4\n0\nSEQEND\n0\nENDSEC\n0\nEOF\n";
        let drawing = parse(text).unwrap();
        assert_eq!(
            drawing.entities,
            vec![Entity::Polyline {
                points: vec![Point { x: 1.0, y: 2.0 }, Point { x: 3.0, y: 4.0 }],
                closed: false,
            }]
        );
    }

    #[test]
    fn test_crlf_line_endings() {
        let text = SAMPLE.replace('\n', "\r\n");
        assert_eq!(parse(&text).unwrap().entities.len(), 5);
    }

    #[test]
    fn test_invalid_group_code() {
        let err = parse("0\nSECTION\nbogus\nENTITIES\n").unwrap_err();
        assert!(matches!(err, DxfError::InvalidGroupCode { line: 3, .. }));
    }

    #[test]
    fn test_invalid_coordinate() {
        let text = "0\nSECTION\n2\nENTITIES\n0\nLINE\n10\nabc\n0\nENDSEC\n";
        assert!(matches!(parse(text).unwrap_err(), DxfError::InvalidValue { code: 10, .. }));
    }

    #[test]
    fn test_missing_entities_section() {
        assert_eq!(
            parse("0\nSECTION\n2\nHEADER\n0\nENDSEC\n0\nEOF\n").unwrap_err(),
            DxfError::MissingEntities
        );
    }

    #[test]
    fn test_truncated() {
        assert_eq!(parse("0\nSECTION\n2").unwrap_err(), DxfError::Truncated);
    }

    #[test]
    fn test_binary_rejected() {
        assert_eq!(parse("AutoCAD Binary DXF\r\n\x1a\0").unwrap_err(), DxfError::Binary);
    }

    #[test]
    fn test_svg_output() {
        let svg = to_svg(&parse(SAMPLE).unwrap()).unwrap();
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("width=\"612.000\""));
        assert!(svg.contains("<line"));
        assert!(svg.contains("<circle"));
        assert!(svg.contains("<path d=\"M"));
        assert!(svg.contains("<polygon"));
        assert!(svg.contains(">hello</text>"));
        assert!(svg.ends_with("</g></svg>"));
    }

    #[test]
    fn test_y_axis_is_flipped() {
        let drawing = Drawing {
            entities: vec![Entity::Line {
                start: Point { x: 0.0, y: 0.0 },
                end: Point { x: 10.0, y: 10.0 },
            }],
            skipped: 0,
        };
        let svg = to_svg(&drawing).unwrap();
        // The origin lands at the bottom-left margin.
        assert!(svg.contains("x1=\"12.240\" y1=\"599.760\""));
        assert!(svg.contains("x2=\"599.760\" y2=\"12.240\""));
    }

    #[test]
    fn test_empty_drawing() {
        let drawing = parse("0\nSECTION\n2\nENTITIES\n0\nENDSEC\n0\nEOF\n").unwrap();
        assert_eq!(to_svg(&drawing).unwrap_err(), DxfError::Empty);
    }
}
