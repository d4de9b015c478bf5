use ndarray::{Array2, ArrayView2};

/// Added to widths and heights so single-pixel boxes never divide by zero.
pub const BBOX_EPS: f32 = 1e-14;

fn center_size(bbox: &[f32; 4]) -> (f32, f32, f32, f32) {
    let width = bbox[2] - bbox[0] + BBOX_EPS;
    let height = bbox[3] - bbox[1] + BBOX_EPS;
    (bbox[0] + 0.5 * width, bbox[1] + 0.5 * height, width, height)
}

/// Regression deltas `[dx, dy, dw, dh]` that move `proposal` onto `reference`.
pub fn encode(reference: &[f32; 4], proposal: &[f32; 4]) -> [f32; 4] {
    let (ex_ctr_x, ex_ctr_y, ex_widths, ex_heights) = center_size(proposal);
    let (gt_ctr_x, gt_ctr_y, gt_widths, gt_heights) = center_size(reference);

    [
        (gt_ctr_x - ex_ctr_x) / ex_widths,
        (gt_ctr_y - ex_ctr_y) / ex_heights,
        (gt_widths / ex_widths).ln(),
        (gt_heights / ex_heights).ln(),
    ]
}

/// Inverse of [`encode`]: applies `deltas` to `proposal`.
pub fn decode(deltas: &[f32; 4], proposal: &[f32; 4]) -> [f32; 4] {
    let (ctr_x, ctr_y, widths, heights) = center_size(proposal);

    let pred_ctr_x = deltas[0] * widths + ctr_x;
    let pred_ctr_y = deltas[1] * heights + ctr_y;
    let pred_w = deltas[2].exp() * widths;
    let pred_h = deltas[3].exp() * heights;

    let x1 = pred_ctr_x - 0.5 * pred_w;
    let y1 = pred_ctr_y - 0.5 * pred_h;
    [x1, y1, x1 + pred_w - BBOX_EPS, y1 + pred_h - BBOX_EPS]
}

fn row(rois: &ArrayView2<f32>, i: usize) -> [f32; 4] {
    [rois[(i, 0)], rois[(i, 1)], rois[(i, 2)], rois[(i, 3)]]
}

/// nonlinear_transform: regression targets from example rois to their ground truth rois
///
/// * `ex_rois` - k * 4 proposals.
/// * `gt_rois` - k * 4 matched ground truth, row for row.
/// * `return` - k * 4 [dx, dy, dw, dh].
pub fn nonlinear_transform(ex_rois: ArrayView2<f32>, gt_rois: ArrayView2<f32>) -> Array2<f32> {
    debug_assert_eq!(ex_rois.nrows(), gt_rois.nrows(), "inconsistent roi number");

    let mut targets = Array2::<f32>::zeros((ex_rois.nrows(), 4));
    for (i, mut target) in targets.outer_iter_mut().enumerate() {
        let deltas = encode(&row(&gt_rois, i), &row(&ex_rois, i));
        for (j, delta) in deltas.into_iter().enumerate() {
            target[j] = delta;
        }
    }
    targets
}

/// nonlinear_pred: boxes predicted by applying k * 4 `box_deltas` to k * 4 `boxes`.
pub fn nonlinear_pred(boxes: ArrayView2<f32>, box_deltas: ArrayView2<f32>) -> Array2<f32> {
    let mut pred_boxes = Array2::<f32>::zeros((boxes.nrows(), 4));
    for (i, mut pred) in pred_boxes.outer_iter_mut().enumerate() {
        let decoded = decode(&row(&box_deltas, i), &row(&boxes, i));
        for (j, coord) in decoded.into_iter().enumerate() {
            pred[j] = coord;
        }
    }
    pred_boxes
}
