//! Piecewise-linear lookup tables

/// Table of (x, y) points with strictly increasing x
///
/// Values outside the table clamp to the first/last y.
#[derive(Debug, Clone, PartialEq)]
pub struct Piecewise {
    points: Vec<(f64, f64)>,
}

impl Piecewise {
    pub fn new(points: &[[f64; 2]]) -> Self {
        Self {
            points: points.iter().map(|p| (p[0], p[1])).collect(),
        }
    }

    pub fn eval(&self, x: f64) -> f64 {
        let Some(&(x0, y0)) = self.points.first() else {
            return 0.0;
        };
        if x <= x0 {
            return y0;
        }
        for w in self.points.windows(2) {
            let ((xa, ya), (xb, yb)) = (w[0], w[1]);
            if x <= xb {
                return ya + (yb - ya) * (x - xa) / (xb - xa);
            }
        }
        self.points.last().map_or(0.0, |p| p.1)
    }
}
