//! Collaborative whiteboard.
//!
//! Every pointer drag emits a `draw` row with absolute coordinates and the pen
//! style; `clear` wipes both canvases. The peer paints each received `draw` as
//! a single dot, so fast drags look dotted on the remote side. That is the
//! wire format, not a rendering bug: strokes are not interpolated remotely.

use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SignalingError;
use crate::signaling::{MessageType, Replay, Signal, SignalingChannel};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WhiteboardStroke {
    Draw {
        x: f32,
        y: f32,
        color: String,
        size: f32,
    },
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    pub const WHITE: Rgba = Rgba([255, 255, 255, 255]);
    pub const BLACK: Rgba = Rgba([0, 0, 0, 255]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidColor(pub String);

impl std::fmt::Display for InvalidColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid colour {:?}", self.0)
    }
}

impl std::error::Error for InvalidColor {}

impl FromStr for Rgba {
    type Err = InvalidColor;

    /// `#rgb` or `#rrggbb`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidColor(s.to_string());
        let hex = s.trim().strip_prefix('#').ok_or_else(invalid)?;
        let expanded = match hex.len() {
            3 => hex.chars().flat_map(|c| [c, c]).collect::<String>(),
            6 => hex.to_string(),
            _ => return Err(invalid()),
        };
        let bytes = ::hex::decode(&expanded).map_err(|_| invalid())?;
        Ok(Rgba([bytes[0], bytes[1], bytes[2], 255]))
    }
}

/// Upper bound on dots stamped for one segment.
const MAX_SEGMENT_STEPS: f32 = 65_536.0;

/// Largest width or height a [`RasterCanvas`] is allocated with.
pub const MAX_CANVAS_DIMENSION: u32 = 8192;

/// Raster target the whiteboard paints on.
pub trait Surface: Send {
    fn paint_point(&mut self, x: f32, y: f32, color: Rgba, size: f32);

    fn clear(&mut self);

    /// Continuous segment, stamped from dots no further apart than a pixel.
    fn paint_segment(&mut self, from: (f32, f32), to: (f32, f32), color: Rgba, size: f32) {
        stamp_segment(self, from, to, color, size);
    }
}

fn stamp_segment<S: Surface + ?Sized>(
    surface: &mut S,
    from: (f32, f32),
    to: (f32, f32),
    color: Rgba,
    size: f32,
) {
    let (dx, dy) = (to.0 - from.0, to.1 - from.1);
    let steps = (dx.hypot(dy).ceil().clamp(1.0, MAX_SEGMENT_STEPS) as u32).max(1);
    for step in 0..=steps {
        let t = step as f32 / steps as f32;
        surface.paint_point(from.0 + dx * t, from.1 + dy * t, color, size);
    }
}

const LEFT: u8 = 1;
const RIGHT: u8 = 2;
const ABOVE: u8 = 4;
const BELOW: u8 = 8;

fn outcode((x, y): (f64, f64), min: (f64, f64), max: (f64, f64)) -> u8 {
    let mut code = 0;
    if x < min.0 {
        code |= LEFT;
    } else if x > max.0 {
        code |= RIGHT;
    }
    if y < min.1 {
        code |= ABOVE;
    } else if y > max.1 {
        code |= BELOW;
    }
    code
}

/// Cohen-Sutherland clip of a segment to the rectangle `min..=max`; `None` if it misses.
/// Works in `f64` and moves endpoints onto the border edge by edge, so far-off
/// endpoints do not lose the part of the segment that crosses the canvas.
fn clip_segment(
    from: (f32, f32),
    to: (f32, f32),
    min: (f32, f32),
    max: (f32, f32),
) -> Option<((f32, f32), (f32, f32))> {
    let wide = |p: (f32, f32)| (f64::from(p.0), f64::from(p.1));
    let (min, max) = (wide(min), wide(max));
    let (mut a, mut b) = (wide(from), wide(to));
    // each pass moves one endpoint onto one edge
    for _ in 0..4 {
        let (code_a, code_b) = (outcode(a, min, max), outcode(b, min, max));
        if code_a | code_b == 0 {
            break;
        }
        if code_a & code_b != 0 {
            return None;
        }
        let out = if code_a != 0 { code_a } else { code_b };
        let (dx, dy) = (b.0 - a.0, b.1 - a.1);
        let moved = if out & ABOVE != 0 {
            (a.0 + dx * (min.1 - a.1) / dy, min.1)
        } else if out & BELOW != 0 {
            (a.0 + dx * (max.1 - a.1) / dy, max.1)
        } else if out & LEFT != 0 {
            (min.0, a.1 + dy * (min.0 - a.0) / dx)
        } else {
            (max.0, a.1 + dy * (max.0 - a.0) / dx)
        };
        if out == code_a {
            a = moved;
        } else {
            b = moved;
        }
    }
    if outcode(a, min, max) | outcode(b, min, max) != 0 {
        return None;
    }
    let narrow = |p: (f64, f64)| (p.0 as f32, p.1 as f32);
    Some((narrow(a), narrow(b)))
}

/// RGBA pixel buffer.
#[derive(Debug, Clone)]
pub struct RasterCanvas {
    width: u32,
    height: u32,
    background: Rgba,
    pixels: Vec<Rgba>,
}

impl RasterCanvas {
    /// Dimensions are capped at [`MAX_CANVAS_DIMENSION`].
    pub fn new(width: u32, height: u32) -> Self {
        let width = width.min(MAX_CANVAS_DIMENSION);
        let height = height.min(MAX_CANVAS_DIMENSION);
        Self {
            width,
            height,
            background: Rgba::WHITE,
            pixels: vec![Rgba::WHITE; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        (x < self.width && y < self.height).then(|| self.pixels[self.index(x, y)])
    }

    pub fn painted_pixels(&self) -> usize {
        self.pixels.iter().filter(|p| **p != self.background).count()
    }
}

impl Surface for RasterCanvas {
    /// Fills every pixel whose square lies within the pen radius, so even the
    /// thinnest pen covers the pixel under the point.
    fn paint_point(&mut self, x: f32, y: f32, color: Rgba, size: f32) {
        if !x.is_finite() || !y.is_finite() {
            return;
        }
        let radius = (size / 2.0).max(0.5);
        let (width, height) = (self.width as f32, self.height as f32);
        if x + radius < 0.0 || y + radius < 0.0 || x - radius > width || y - radius > height {
            return;
        }
        let min_x = (x - radius).floor().max(0.0) as u32;
        let min_y = (y - radius).floor().max(0.0) as u32;
        let max_x = ((x + radius).floor() + 1.0).min(width) as u32;
        let max_y = ((y + radius).floor() + 1.0).min(height) as u32;
        for py in min_y..max_y {
            for px in min_x..max_x {
                let gap_x = (px as f32 - x).max(x - (px as f32 + 1.0)).max(0.0);
                let gap_y = (py as f32 - y).max(y - (py as f32 + 1.0)).max(0.0);
                if gap_x * gap_x + gap_y * gap_y <= radius * radius {
                    let at = self.index(px, py);
                    self.pixels[at] = color;
                }
            }
        }
    }

    fn clear(&mut self) {
        self.pixels.fill(self.background);
    }

    fn paint_segment(&mut self, from: (f32, f32), to: (f32, f32), color: Rgba, size: f32) {
        if ![from.0, from.1, to.0, to.1].iter().all(|v| v.is_finite()) {
            return;
        }
        let margin = (size / 2.0).max(0.5) + 1.0;
        let min = (-margin, -margin);
        let max = (self.width as f32 + margin, self.height as f32 + margin);
        if let Some((from, to)) = clip_segment(from, to, min, max) {
            stamp_segment(self, from, to, color, size);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pen {
    pub color: String,
    pub size: f32,
}

impl Default for Pen {
    fn default() -> Self {
        Self {
            color: "#000000".into(),
            size: 2.0,
        }
    }
}

/// One participant's whiteboard: local surface plus stroke replication.
pub struct Whiteboard<S: Surface + 'static> {
    channel: SignalingChannel,
    surface: Arc<Mutex<S>>,
    pen: Pen,
    pen_rgba: Rgba,
    last_point: Option<(f32, f32)>,
    remote: Option<JoinHandle<()>>,
}

impl<S: Surface + 'static> Whiteboard<S> {
    pub fn new(channel: SignalingChannel, surface: S) -> Self {
        Self {
            channel,
            surface: Arc::new(Mutex::new(surface)),
            pen: Pen::default(),
            pen_rgba: Rgba::BLACK,
            last_point: None,
            remote: None,
        }
    }

    pub fn surface(&self) -> Arc<Mutex<S>> {
        self.surface.clone()
    }

    pub fn pen(&self) -> &Pen {
        &self.pen
    }

    pub fn set_pen(&mut self, color: &str, size: f32) -> Result<(), InvalidColor> {
        self.pen_rgba = color.parse()?;
        self.pen = Pen {
            color: color.to_string(),
            size: size.max(0.5),
        };
        Ok(())
    }

    /// Starts applying the peer's strokes to the local surface.
    pub async fn attach(&mut self, replay: Replay) -> Result<(), SignalingError> {
        self.detach();
        let mut sub = self.channel.subscribe(replay).await?;
        let surface = self.surface.clone();
        self.remote = Some(tokio::spawn(async move {
            while let Some(row) = sub.next().await {
                if row.message_type != MessageType::Whiteboard {
                    continue;
                }
                match Signal::decode(&row) {
                    Ok(Signal::Whiteboard(stroke)) => apply_remote(&surface, &stroke),
                    Ok(_) => {}
                    Err(err) => warn!(id = %row.id, error = %err, "whiteboard stroke dropped"),
                }
            }
        }));
        Ok(())
    }

    /// Stops applying remote strokes and releases the subscription.
    pub fn detach(&mut self) {
        if let Some(task) = self.remote.take() {
            task.abort();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.remote.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub async fn pointer_down(&mut self, x: f32, y: f32) {
        self.last_point = Some((x, y));
        self.surface
            .lock()
            .paint_point(x, y, self.pen_rgba, self.pen.size);
        self.emit_draw(x, y).await;
    }

    /// Ignored unless the pointer is down.
    pub async fn pointer_move(&mut self, x: f32, y: f32) {
        let Some(from) = self.last_point else {
            return;
        };
        self.last_point = Some((x, y));
        self.surface
            .lock()
            .paint_segment(from, (x, y), self.pen_rgba, self.pen.size);
        self.emit_draw(x, y).await;
    }

    pub fn pointer_up(&mut self) {
        self.last_point = None;
    }

    /// Wipes both canvases.
    pub async fn clear(&mut self) {
        self.surface.lock().clear();
        self.publish(WhiteboardStroke::Clear).await;
    }

    async fn emit_draw(&self, x: f32, y: f32) {
        self.publish(WhiteboardStroke::Draw {
            x,
            y,
            color: self.pen.color.clone(),
            size: self.pen.size,
        })
        .await;
    }

    async fn publish(&self, stroke: WhiteboardStroke) {
        if let Err(err) = self.channel.publish(&Signal::Whiteboard(stroke)).await {
            warn!(error = %err, "whiteboard stroke not published");
        }
    }
}

impl<S: Surface + 'static> Drop for Whiteboard<S> {
    fn drop(&mut self) {
        self.detach();
    }
}

fn apply_remote<S: Surface>(surface: &Mutex<S>, stroke: &WhiteboardStroke) {
    match stroke {
        WhiteboardStroke::Draw { x, y, color, size } => match color.parse::<Rgba>() {
            Ok(rgba) => surface.lock().paint_point(*x, *y, rgba, *size),
            Err(err) => warn!(error = %err, "remote stroke dropped"),
        },
        WhiteboardStroke::Clear => {
            debug!("remote clear");
            surface.lock().clear();
        }
    }
}
